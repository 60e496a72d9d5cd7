use crate::error::{StageError, TeardownError};
use crate::frame::{AudioChunk, ControlFrame, Frame, SpeechBoundary};
use crate::interruption::{InterruptOutcome, InterruptionController};
use crate::pipeline::{Emitter, Stage, StageKind};
use crate::vad::{VadMode, VoiceActivityDetector};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides which audio reaches speech recognition and marks speech boundaries.
///
/// In `Gate` mode audio between utterances is held back; the chunks just before
/// speech was confirmed are kept as pre-roll and prepended to the `Started` chunk
/// so the onset of the utterance is not lost. In `PassThrough` mode all audio is
/// forwarded and only the boundary markers differ.
pub struct VoiceActivityGate {
    detector: Box<dyn VoiceActivityDetector>,
    mode: VadMode,
    interruption: Arc<InterruptionController>,
    pre_roll: VecDeque<AudioChunk>,
    pre_roll_limit: Duration,
}

impl VoiceActivityGate {
    pub fn new(
        detector: Box<dyn VoiceActivityDetector>,
        mode: VadMode,
        interruption: Arc<InterruptionController>,
        pre_roll_limit: Duration,
    ) -> Self {
        Self {
            detector,
            mode,
            interruption,
            pre_roll: VecDeque::new(),
            pre_roll_limit,
        }
    }

    fn hold(&mut self, chunk: AudioChunk) {
        self.pre_roll.push_back(chunk);
        let mut held: Duration = self.pre_roll.iter().map(AudioChunk::duration).sum();
        while held > self.pre_roll_limit {
            match self.pre_roll.pop_front() {
                Some(dropped) => held = held.saturating_sub(dropped.duration()),
                None => break,
            }
        }
    }

    fn with_pre_roll(&mut self, chunk: AudioChunk) -> AudioChunk {
        if self.pre_roll.is_empty() {
            return chunk;
        }
        let timestamp = self.pre_roll.front().map_or(chunk.timestamp, |c| c.timestamp);
        let mut samples = BytesMut::new();
        for held in self.pre_roll.drain(..) {
            samples.extend_from_slice(&held.samples);
        }
        samples.extend_from_slice(&chunk.samples);
        AudioChunk {
            samples: samples.freeze(),
            sample_rate: chunk.sample_rate,
            timestamp,
            boundary: chunk.boundary,
        }
    }
}

#[async_trait]
impl Stage for VoiceActivityGate {
    fn kind(&self) -> StageKind {
        StageKind::VoiceActivityGate
    }

    async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError> {
        let Frame::AudioChunk(chunk) = frame else {
            return out.emit(frame).await;
        };
        let decision = self.detector.analyze(&chunk);

        match decision.boundary {
            Some(SpeechBoundary::Started) => {
                debug!(at = ?chunk.timestamp, "user speech started");
                if let InterruptOutcome::Interrupted(turn_id) =
                    self.interruption.on_user_speech().await
                {
                    out.emit(ControlFrame::Interrupt(turn_id)).await?;
                }
                let chunk = chunk.with_boundary(Some(SpeechBoundary::Started));
                let chunk = match self.mode {
                    VadMode::Gate => self.with_pre_roll(chunk),
                    VadMode::PassThrough => chunk,
                };
                out.emit(chunk).await
            }
            Some(SpeechBoundary::Stopped) => {
                debug!(at = ?chunk.timestamp, "user speech stopped");
                out.emit(chunk.with_boundary(Some(SpeechBoundary::Stopped)))
                    .await
            }
            None if decision.speaking || self.mode == VadMode::PassThrough => {
                out.emit(chunk).await
            }
            None => {
                self.hold(chunk);
                Ok(())
            }
        }
    }

    async fn release(&mut self) -> Result<(), TeardownError> {
        self.pre_roll.clear();
        self.detector.reset();
        Ok(())
    }
}
