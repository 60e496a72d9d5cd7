//! A link joins two adjacent stages.
//!
//! Ordinary frames travel over a bounded queue, so a slow consumer suspends its
//! producer. Priority control frames (`Interrupt`, `SessionEnd`) travel over a
//! separate unbounded queue that the receiver always drains first.

use crate::error::StageError;
use crate::frame::{ControlFrame, Frame};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Decides whether a frame may still be delivered on a link.
pub trait FrameFilter: Send + Sync {
    fn admits(&self, frame: &Frame) -> bool;
}

/// Creates a link with room for `capacity` ordinary frames.
///
/// Once `ended` is cancelled the sender silently drops ordinary frames, including
/// one that is blocked waiting for queue space.
pub fn link(
    capacity: usize,
    filter: Option<Arc<dyn FrameFilter>>,
    ended: CancellationToken,
) -> (LinkSender, LinkReceiver) {
    let (data_tx, data_rx) = mpsc::channel(capacity.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    (
        LinkSender {
            data: data_tx,
            control: control_tx,
            ended,
        },
        LinkReceiver {
            data: data_rx,
            control: control_rx,
            filter,
        },
    )
}

#[derive(Clone)]
pub struct LinkSender {
    data: mpsc::Sender<Frame>,
    control: mpsc::UnboundedSender<ControlFrame>,
    ended: CancellationToken,
}

impl LinkSender {
    pub async fn send(&self, frame: Frame) -> Result<(), StageError> {
        match frame {
            Frame::Control(control) if control.is_priority() => self
                .control
                .send(control)
                .map_err(|_| StageError::DownstreamClosed),
            frame => {
                if self.ended.is_cancelled() {
                    return Ok(());
                }
                tokio::select! {
                    biased;
                    _ = self.ended.cancelled() => Ok(()),
                    sent = self.data.send(frame) => sent.map_err(|_| StageError::DownstreamClosed),
                }
            }
        }
    }

    /// Cancelled once the session starts ending.
    pub fn ended(&self) -> &CancellationToken {
        &self.ended
    }

    pub fn is_closed(&self) -> bool {
        self.data.is_closed()
    }
}

pub struct LinkReceiver {
    data: mpsc::Receiver<Frame>,
    control: mpsc::UnboundedReceiver<ControlFrame>,
    filter: Option<Arc<dyn FrameFilter>>,
}

impl LinkReceiver {
    /// Next frame, priority control first. `None` once the sending side is gone
    /// and both queues are drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let frame = tokio::select! {
                biased;
                Some(control) = self.control.recv() => Frame::Control(control),
                Some(frame) = self.data.recv() => frame,
                else => return None,
            };
            match &self.filter {
                Some(filter) if !filter.admits(&frame) => continue,
                _ => return Some(frame),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Role, TurnMessage};
    use std::time::Duration;

    fn text(n: usize) -> Frame {
        Frame::Transcript {
            text: n.to_string(),
            is_final: true,
        }
    }

    #[tokio::test]
    async fn test_priority_control_overtakes_queued_frames() {
        let (tx, mut rx) = link(8, None, CancellationToken::new());
        tx.send(text(1)).await.unwrap();
        tx.send(text(2)).await.unwrap();
        tx.send(ControlFrame::Interrupt(7).into()).await.unwrap();

        assert_eq!(rx.recv().await, Some(ControlFrame::Interrupt(7).into()));
        assert_eq!(rx.recv().await, Some(text(1)));
        assert_eq!(rx.recv().await, Some(text(2)));
    }

    #[tokio::test]
    async fn test_end_of_turn_stays_in_order() {
        let (tx, mut rx) = link(8, None, CancellationToken::new());
        tx.send(text(1)).await.unwrap();
        tx.send(ControlFrame::EndOfTurn(1).into()).await.unwrap();

        assert_eq!(rx.recv().await, Some(text(1)));
        assert_eq!(rx.recv().await, Some(ControlFrame::EndOfTurn(1).into()));
    }

    #[tokio::test]
    async fn test_control_bypasses_full_queue() {
        let (tx, mut rx) = link(1, None, CancellationToken::new());
        tx.send(text(1)).await.unwrap();
        // The data queue is full; a priority frame must not block.
        tokio::time::timeout(
            Duration::from_millis(100),
            tx.send(ControlFrame::SessionEnd.into()),
        )
        .await
        .expect("control send blocked")
        .unwrap();
        assert_eq!(rx.recv().await, Some(ControlFrame::SessionEnd.into()));
    }

    #[tokio::test]
    async fn test_ended_releases_blocked_sender_and_drops_frames() {
        let ended = CancellationToken::new();
        let (tx, mut rx) = link(1, None, ended.clone());
        tx.send(text(1)).await.unwrap();

        let blocked = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.send(text(2)).await })
        };
        tokio::task::yield_now().await;
        ended.cancel();
        blocked.await.unwrap().unwrap();
        tx.send(text(3)).await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(text(1)));
        assert_eq!(rx.recv().await, None);
    }

    struct DropTurn(u64);

    impl FrameFilter for DropTurn {
        fn admits(&self, frame: &Frame) -> bool {
            frame.turn_id() != Some(self.0)
        }
    }

    #[tokio::test]
    async fn test_filter_drops_frames_on_receive() {
        let (tx, mut rx) = link(8, Some(Arc::new(DropTurn(2))), CancellationToken::new());
        for turn_id in [1, 2, 3] {
            tx.send(
                TurnMessage {
                    role: Role::Assistant,
                    text: "x".into(),
                    turn_id,
                }
                .into(),
            )
            .await
            .unwrap();
        }
        drop(tx);

        let mut seen = vec![];
        while let Some(frame) = rx.recv().await {
            seen.push(frame.turn_id().unwrap());
        }
        assert_eq!(seen, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_send_to_closed_link_reports_downstream_closed() {
        let (tx, rx) = link(1, None, CancellationToken::new());
        drop(rx);
        assert_eq!(tx.send(text(1)).await, Err(StageError::DownstreamClosed));
        assert!(tx.is_closed());
    }
}
