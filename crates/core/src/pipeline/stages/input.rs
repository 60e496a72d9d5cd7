use crate::error::StageError;
use crate::frame::Frame;
use crate::pipeline::{Emitter, Stage, StageKind};
use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

/// Head of the chain: validates inbound audio and stamps stream timestamps.
pub struct InputAdapter {
    sample_rate: u32,
    samples_seen: u64,
}

impl InputAdapter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples_seen: 0,
        }
    }
}

#[async_trait]
impl Stage for InputAdapter {
    fn kind(&self) -> StageKind {
        StageKind::InputAdapter
    }

    async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError> {
        let Frame::AudioChunk(mut chunk) = frame else {
            return out.emit(frame).await;
        };
        if chunk.samples.is_empty() {
            trace!("dropping empty audio chunk");
            return Ok(());
        }
        if chunk.samples.len() % 2 != 0 {
            return Err(StageError::Decode {
                stage: self.kind(),
                reason: format!("PCM16 payload has odd length {}", chunk.samples.len()),
            });
        }
        if chunk.sample_rate != self.sample_rate {
            return Err(StageError::Decode {
                stage: self.kind(),
                reason: format!(
                    "expected {} Hz audio, got {} Hz",
                    self.sample_rate, chunk.sample_rate
                ),
            });
        }

        chunk.timestamp =
            Duration::from_secs_f64(self.samples_seen as f64 / self.sample_rate as f64);
        self.samples_seen += chunk.sample_count() as u64;
        out.emit(chunk).await
    }
}
