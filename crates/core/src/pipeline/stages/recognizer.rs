use super::remote_error;
use crate::error::{StageError, TeardownError};
use crate::frame::{AudioChunk, Frame, SpeechBoundary};
use crate::pipeline::{Emitter, Stage, StageKind};
use crate::speech::SpeechToText;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Collects one utterance between speech boundaries and transcribes it.
pub struct SpeechRecognizer {
    stt: Arc<dyn SpeechToText>,
    sample_rate: u32,
    min_utterance: Duration,
    utterance: BytesMut,
    collecting: bool,
}

impl SpeechRecognizer {
    pub fn new(stt: Arc<dyn SpeechToText>, sample_rate: u32, min_utterance: Duration) -> Self {
        Self {
            stt,
            sample_rate,
            min_utterance,
            utterance: BytesMut::new(),
            collecting: false,
        }
    }

    fn buffered(&self) -> Duration {
        Duration::from_secs_f64((self.utterance.len() / 2) as f64 / self.sample_rate as f64)
    }

    async fn finish_utterance(&mut self, out: &Emitter) -> Result<(), StageError> {
        self.collecting = false;
        let duration = self.buffered();
        let pcm = self.utterance.split().freeze();
        if duration < self.min_utterance {
            debug!(?duration, "utterance too short, skipping transcription");
            return Ok(());
        }

        let text = self
            .stt
            .transcribe(pcm, self.sample_rate)
            .await
            .map_err(|e| remote_error(self.kind(), e))?;
        if text.trim().is_empty() {
            debug!(?duration, "empty transcription");
            return Ok(());
        }
        info!(?duration, transcript = %text, "user utterance transcribed");
        out.emit(Frame::Transcript {
            text,
            is_final: true,
        })
        .await
    }

    async fn on_audio(&mut self, chunk: AudioChunk, out: &Emitter) -> Result<(), StageError> {
        match chunk.boundary {
            Some(SpeechBoundary::Started) => {
                self.utterance.clear();
                self.utterance.extend_from_slice(&chunk.samples);
                self.collecting = true;
                Ok(())
            }
            Some(SpeechBoundary::Stopped) if self.collecting => {
                self.utterance.extend_from_slice(&chunk.samples);
                self.finish_utterance(out).await
            }
            _ if self.collecting => {
                self.utterance.extend_from_slice(&chunk.samples);
                Ok(())
            }
            // Audio outside an utterance (pass-through mode).
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Stage for SpeechRecognizer {
    fn kind(&self) -> StageKind {
        StageKind::SpeechToText
    }

    async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError> {
        match frame {
            Frame::AudioChunk(chunk) => self.on_audio(chunk, out).await,
            other => out.emit(other).await,
        }
    }

    async fn release(&mut self) -> Result<(), TeardownError> {
        self.utterance.clear();
        self.collecting = false;
        Ok(())
    }
}
