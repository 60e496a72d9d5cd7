//! Pipeline Stage framework
//!
//! A pipeline is a strict linear chain of [`Stage`]s, each running in its own task
//! and joined to its neighbours by a [`link`]. The runner owns the control-frame
//! protocol so individual stages only deal with the frames they transform:
//!
//! - `SessionEnd`: the stage finishes the frame in progress, releases its
//!   resources, forwards `SessionEnd` and exits.
//! - `Interrupt`: the stage drops state for the superseded turn, then forwards it.
//! - A failing `process` call is reported to the supervisor and ends the stage.
//!
//! The tail of the chain is a sink that acknowledges `SessionEnd` to
//! [`Pipeline::shutdown`].

pub mod link;
pub mod stages;

use crate::error::{StageError, TeardownError};
use crate::frame::{ControlFrame, Frame, TurnId};
use async_trait::async_trait;
use link::{FrameFilter, LinkReceiver, LinkSender};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

pub use link::link;

/// Default number of ordinary frames a link buffers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Identity of a stage, used in logs and error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    InputAdapter,
    VoiceActivityGate,
    SpeechToText,
    UserTurnAggregator,
    Inference,
    AssistantTurnAggregator,
    SpeechSynthesis,
    OutputAdapter,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::InputAdapter => "input_adapter",
            StageKind::VoiceActivityGate => "voice_activity_gate",
            StageKind::SpeechToText => "speech_to_text",
            StageKind::UserTurnAggregator => "user_turn_aggregator",
            StageKind::Inference => "inference",
            StageKind::AssistantTurnAggregator => "assistant_turn_aggregator",
            StageKind::SpeechSynthesis => "speech_synthesis",
            StageKind::OutputAdapter => "output_adapter",
        };
        f.write_str(name)
    }
}

/// The downstream side of a stage.
#[derive(Clone)]
pub struct Emitter {
    link: LinkSender,
}

impl Emitter {
    pub fn new(link: LinkSender) -> Self {
        Self { link }
    }

    /// Sends a frame downstream, suspending while the next link is full.
    ///
    /// After the session has started ending, ordinary frames are discarded.
    pub async fn emit(&self, frame: impl Into<Frame>) -> Result<(), StageError> {
        self.link.send(frame.into()).await
    }

    /// Cancelled once the session starts ending. Long-running work should stop.
    pub fn ended(&self) -> &CancellationToken {
        self.link.ended()
    }
}

/// One unit of the conversational pipeline.
#[async_trait]
pub trait Stage: Send {
    fn kind(&self) -> StageKind;

    /// Handles one ordinary or in-band frame, emitting zero or more frames in order.
    /// Frames a stage does not handle should be forwarded unchanged.
    async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError>;

    /// Drops any state belonging to the interrupted turn.
    async fn interrupt(&mut self, _turn_id: TurnId) {}

    /// Releases held resources. Called exactly once, when the stage exits.
    async fn release(&mut self) -> Result<(), TeardownError> {
        Ok(())
    }
}

/// A fatal stage error, reported to the session supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub stage: StageKind,
    pub error: StageError,
}

async fn run_stage(
    mut stage: Box<dyn Stage>,
    mut input: LinkReceiver,
    out: Emitter,
    failures: mpsc::UnboundedSender<StageFailure>,
) {
    let kind = stage.kind();
    let mut saw_session_end = false;

    while let Some(frame) = input.recv().await {
        let result = match frame {
            Frame::Control(ControlFrame::SessionEnd) => {
                saw_session_end = true;
                break;
            }
            Frame::Control(ControlFrame::Interrupt(turn_id)) => {
                debug!(turn_id, "interrupt received");
                stage.interrupt(turn_id).await;
                out.emit(frame).await
            }
            frame => stage.process(frame, &out).await,
        };
        match result {
            Ok(()) => {}
            Err(StageError::DownstreamClosed) => {
                debug!("downstream closed, stopping stage");
                break;
            }
            Err(e) => {
                error!(error = %e, "stage failed");
                let _ = failures.send(StageFailure {
                    stage: kind,
                    error: e,
                });
                break;
            }
        }
    }

    if let Err(e) = stage.release().await {
        warn!(error = %e, "stage failed to release resources");
    }
    if saw_session_end {
        let _ = out.emit(ControlFrame::SessionEnd).await;
    }
    debug!("stage exited");
}

/// Receives whatever leaves the last stage. Ordinary frames are dropped;
/// `SessionEnd` is acknowledged once.
async fn run_sink(mut input: LinkReceiver, ack: oneshot::Sender<()>) {
    while let Some(frame) = input.recv().await {
        if let Frame::Control(ControlFrame::SessionEnd) = frame {
            let _ = ack.send(());
            return;
        }
    }
}

/// A running stage chain.
pub struct Pipeline {
    head: LinkSender,
    ended: CancellationToken,
    tasks: Vec<(StageKind, JoinHandle<()>)>,
    sink: Option<JoinHandle<()>>,
    tail_ack: Option<oneshot::Receiver<()>>,
    failures: mpsc::UnboundedReceiver<StageFailure>,
}

impl Pipeline {
    /// Spawns one task per stage. `output_filter` is installed on the link that
    /// feeds the last stage.
    pub fn spawn(
        stages: Vec<Box<dyn Stage>>,
        capacity: usize,
        output_filter: Option<Arc<dyn FrameFilter>>,
    ) -> Self {
        let ended = CancellationToken::new();
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let count = stages.len();

        let filter_for = |index: usize| {
            if index + 1 == count {
                output_filter.clone()
            } else {
                None
            }
        };

        let (head, mut upstream) = link(capacity, filter_for(0), ended.clone());
        let mut tasks = Vec::with_capacity(count);
        for (index, stage) in stages.into_iter().enumerate() {
            let kind = stage.kind();
            let (tx, rx) = link(capacity, filter_for(index + 1), ended.clone());
            let input = std::mem::replace(&mut upstream, rx);
            let task = tokio::spawn(
                run_stage(stage, input, Emitter::new(tx), failures_tx.clone())
                    .instrument(info_span!("stage", stage = %kind)),
            );
            tasks.push((kind, task));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let sink = tokio::spawn(run_sink(upstream, ack_tx).in_current_span());

        Self {
            head,
            ended,
            tasks,
            sink: Some(sink),
            tail_ack: Some(ack_rx),
            failures,
        }
    }

    /// Sender into the first stage.
    pub fn head(&self) -> LinkSender {
        self.head.clone()
    }

    /// Waits for the next fatal stage error. `None` once every stage has exited.
    pub async fn next_failure(&mut self) -> Option<StageFailure> {
        self.failures.recv().await
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Ends the session: injects `SessionEnd` at the head and waits up to
    /// `drain_timeout` for the tail to acknowledge it. Stages still running
    /// afterwards are aborted. Calling it again is a no-op.
    pub async fn shutdown(&mut self, drain_timeout: Duration) -> Result<(), TeardownError> {
        let Some(ack) = self.tail_ack.take() else {
            return Ok(());
        };
        self.ended.cancel();
        if self.head.send(ControlFrame::SessionEnd.into()).await.is_err() {
            debug!("pipeline head already closed");
        }

        let result = match tokio::time::timeout(drain_timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                // The chain broke before SessionEnd reached the tail.
                debug!("pipeline drained without tail acknowledgement");
                Ok(())
            }
            Err(_) => Err(TeardownError::DrainTimeout(drain_timeout)),
        };

        for (kind, task) in self.tasks.drain(..) {
            if !task.is_finished() {
                warn!(stage = %kind, "stage still running after drain, aborting");
                task.abort();
            }
        }
        if let Some(sink) = self.sink.take() {
            sink.abort();
        }
        result
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.ended.cancel();
        for (_, task) in &self.tasks {
            task.abort();
        }
        if let Some(sink) = &self.sink {
            sink.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// An emitter whose frames land in the returned receiver.
    pub fn emitter(capacity: usize) -> (Emitter, LinkReceiver) {
        let (tx, rx) = link(capacity, None, CancellationToken::new());
        (Emitter::new(tx), rx)
    }

    /// Drains everything currently queued without waiting.
    pub async fn drain(rx: &mut LinkReceiver) -> Vec<Frame> {
        let mut frames = vec![];
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(20), rx.recv()).await
        {
            frames.push(frame);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        kind: StageKind,
        seen: Arc<Mutex<Vec<Frame>>>,
        releases: Arc<Mutex<usize>>,
        interrupts: Arc<Mutex<Vec<TurnId>>>,
    }

    #[async_trait]
    impl Stage for Recorder {
        fn kind(&self) -> StageKind {
            self.kind
        }

        async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError> {
            self.seen.lock().unwrap().push(frame.clone());
            out.emit(frame).await
        }

        async fn interrupt(&mut self, turn_id: TurnId) {
            self.interrupts.lock().unwrap().push(turn_id);
        }

        async fn release(&mut self) -> Result<(), TeardownError> {
            *self.releases.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Stage for Failing {
        fn kind(&self) -> StageKind {
            StageKind::SpeechToText
        }

        async fn process(&mut self, _frame: Frame, _out: &Emitter) -> Result<(), StageError> {
            Err(StageError::Remote {
                stage: StageKind::SpeechToText,
                reason: "connection reset".into(),
            })
        }
    }

    /// Emits `count` numbered transcripts for the first frame it sees.
    struct Burst {
        count: usize,
        emitted: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for Burst {
        fn kind(&self) -> StageKind {
            StageKind::Inference
        }

        async fn process(&mut self, _frame: Frame, out: &Emitter) -> Result<(), StageError> {
            for n in 0..self.count {
                out.emit(Frame::Transcript {
                    text: n.to_string(),
                    is_final: true,
                })
                .await?;
                self.emitted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    /// Blocks on its first frame until the gate opens.
    struct Gated {
        gate: Option<oneshot::Receiver<()>>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Stage for Gated {
        fn kind(&self) -> StageKind {
            StageKind::SpeechSynthesis
        }

        async fn process(&mut self, frame: Frame, _out: &Emitter) -> Result<(), StageError> {
            if let Some(gate) = self.gate.take() {
                let _ = gate.await;
            }
            if let Frame::Transcript { text, .. } = frame {
                self.seen.lock().unwrap().push(text);
            }
            Ok(())
        }
    }

    fn recorder(
        kind: StageKind,
    ) -> (
        Box<dyn Stage>,
        Arc<Mutex<Vec<Frame>>>,
        Arc<Mutex<usize>>,
        Arc<Mutex<Vec<TurnId>>>,
    ) {
        let seen = Arc::new(Mutex::new(vec![]));
        let releases = Arc::new(Mutex::new(0));
        let interrupts = Arc::new(Mutex::new(vec![]));
        (
            Box::new(Recorder {
                kind,
                seen: seen.clone(),
                releases: releases.clone(),
                interrupts: interrupts.clone(),
            }),
            seen,
            releases,
            interrupts,
        )
    }

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::VoiceActivityGate.to_string(), "voice_activity_gate");
        assert_eq!(
            serde_json::to_string(&StageKind::OutputAdapter).unwrap(),
            "\"output_adapter\""
        );
    }

    #[tokio::test]
    async fn test_frames_flow_in_order_and_shutdown_releases_once() {
        let (first, _, first_releases, _) = recorder(StageKind::InputAdapter);
        let (last, seen, last_releases, _) = recorder(StageKind::OutputAdapter);
        let mut pipeline = Pipeline::spawn(vec![first, last], 4, None);

        let head = pipeline.head();
        for n in 0..10 {
            head.send(Frame::Transcript {
                text: n.to_string(),
                is_final: true,
            })
            .await
            .unwrap();
        }
        while seen.lock().unwrap().len() < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();

        let texts: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|f| match f {
                Frame::Transcript { text, .. } => text.clone(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
        assert_eq!(texts, expected);
        assert_eq!(*first_releases.lock().unwrap(), 1);
        assert_eq!(*last_releases.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_reaches_every_stage() {
        let (first, _, _, first_interrupts) = recorder(StageKind::Inference);
        let (last, _, _, last_interrupts) = recorder(StageKind::OutputAdapter);
        let mut pipeline = Pipeline::spawn(vec![first, last], 4, None);

        pipeline
            .head()
            .send(ControlFrame::Interrupt(5).into())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(*first_interrupts.lock().unwrap(), vec![5]);
        assert_eq!(*last_interrupts.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_stage_failure_is_reported_and_chain_collapses() {
        let (last, _, last_releases, _) = recorder(StageKind::OutputAdapter);
        let mut pipeline = Pipeline::spawn(vec![Box::new(Failing), last], 4, None);

        pipeline
            .head()
            .send(Frame::Transcript {
                text: "hi".into(),
                is_final: true,
            })
            .await
            .unwrap();

        let failure = pipeline.next_failure().await.unwrap();
        assert_eq!(failure.stage, StageKind::SpeechToText);
        assert!(matches!(failure.error, StageError::Remote { .. }));

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(*last_releases.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_bounds_producer() {
        let emitted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(vec![]));
        let (open, gate) = oneshot::channel();
        let burst = Burst {
            count: 100,
            emitted: emitted.clone(),
        };
        let gated = Gated {
            gate: Some(gate),
            seen: seen.clone(),
        };
        let mut pipeline = Pipeline::spawn(vec![Box::new(burst), Box::new(gated)], 4, None);

        pipeline
            .head()
            .send(ControlFrame::EndOfTurn(1).into())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // One frame held by the consumer, four queued.
        assert!(emitted.load(Ordering::SeqCst) <= 5);

        open.send(()).unwrap();
        while seen.lock().unwrap().len() < 100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let expected: Vec<String> = (0..100).map(|n| n.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
