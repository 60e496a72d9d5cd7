use super::remote_error;
use crate::error::{StageError, TeardownError};
use crate::frame::{ControlFrame, Frame, Role, TurnId, TurnMessage};
use crate::interruption::InterruptionController;
use crate::pipeline::{Emitter, Stage, StageKind};
use crate::speech::TextToSpeech;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Byte offset just past the first sentence-ending punctuation that is followed
/// by whitespace.
fn sentence_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?' | ';' | ':')
            && chars.peek().is_some_and(|(_, next)| next.is_whitespace())
        {
            return Some(index + c.len_utf8());
        }
    }
    None
}

/// Synthesises assistant text sentence by sentence as it streams in.
pub struct SpeechSynthesizer {
    tts: Arc<dyn TextToSpeech>,
    interruption: Arc<InterruptionController>,
    pending: String,
    turn_id: Option<TurnId>,
}

impl SpeechSynthesizer {
    pub fn new(tts: Arc<dyn TextToSpeech>, interruption: Arc<InterruptionController>) -> Self {
        Self {
            tts,
            interruption,
            pending: String::new(),
            turn_id: None,
        }
    }

    async fn speak(&self, text: &str, turn_id: TurnId, out: &Emitter) -> Result<(), StageError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let cancelled = self.interruption.synthesis_token(turn_id);
        if cancelled.is_cancelled() {
            return Ok(());
        }

        let mut audio = tokio::select! {
            biased;
            _ = cancelled.cancelled() => return Ok(()),
            _ = out.ended().cancelled() => return Ok(()),
            audio = self.tts.synthesize(text.to_string()) => {
                audio.map_err(|e| remote_error(self.kind(), e))?
            }
        };
        let sample_rate = self.tts.sample_rate();
        debug!(turn_id, chars = text.len(), "synthesising sentence");

        loop {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    info!(turn_id, "synthesis cancelled");
                    return Ok(());
                }
                _ = out.ended().cancelled() => return Ok(()),
                chunk = audio.next() => match chunk {
                    Some(Ok(audio)) => {
                        out.emit(Frame::SynthesizedAudio {
                            audio,
                            sample_rate,
                            turn_id,
                        })
                        .await?;
                    }
                    Some(Err(e)) => return Err(remote_error(self.kind(), e)),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn on_text(&mut self, message: TurnMessage, out: &Emitter) -> Result<(), StageError> {
        if self.turn_id != Some(message.turn_id) {
            self.pending.clear();
            self.turn_id = Some(message.turn_id);
        }
        self.pending.push_str(&message.text);

        while let Some(end) = sentence_end(&self.pending) {
            let sentence: String = self.pending.drain(..end).collect();
            self.speak(&sentence, message.turn_id, out).await?;
        }
        out.emit(message).await
    }

    async fn on_end_of_turn(&mut self, turn_id: TurnId, out: &Emitter) -> Result<(), StageError> {
        if self.turn_id == Some(turn_id) {
            let rest = std::mem::take(&mut self.pending);
            self.turn_id = None;
            self.speak(&rest, turn_id, out).await?;
        }
        out.emit(ControlFrame::EndOfTurn(turn_id)).await
    }
}

#[async_trait]
impl Stage for SpeechSynthesizer {
    fn kind(&self) -> StageKind {
        StageKind::SpeechSynthesis
    }

    async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError> {
        match frame {
            Frame::TurnMessage(message) if message.role == Role::Assistant => {
                self.on_text(message, out).await
            }
            Frame::Control(ControlFrame::EndOfTurn(turn_id)) => {
                self.on_end_of_turn(turn_id, out).await
            }
            other => out.emit(other).await,
        }
    }

    async fn interrupt(&mut self, turn_id: TurnId) {
        if self.turn_id == Some(turn_id) {
            self.pending.clear();
            self.turn_id = None;
        }
    }

    async fn release(&mut self) -> Result<(), TeardownError> {
        self.pending.clear();
        self.turn_id = None;
        Ok(())
    }
}
