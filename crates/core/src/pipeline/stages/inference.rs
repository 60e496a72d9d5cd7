use super::{context_error, remote_error};
use crate::context::SharedContext;
use crate::error::StageError;
use crate::frame::{ControlFrame, Frame, Role, TurnId, TurnMessage};
use crate::interruption::InterruptionController;
use crate::llm_client::{LLMClient, LLMStreamEvent};
use crate::pipeline::{Emitter, Stage, StageKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Streams an assistant response for every user or system turn.
///
/// The LLM sees the whole conversation context, not just the latest message.
/// The assistant turn is opened in the context before the history is read, and
/// a new request waits until the previous response has been recorded (completed
/// or truncated) so it is never missing from the history. Streaming stops as soon as the turn is interrupted or the session ends; an
/// interrupted response gets no `EndOfTurn`.
pub struct Inference {
    llm: Arc<dyn LLMClient>,
    context: SharedContext,
    interruption: Arc<InterruptionController>,
    previous: Option<TurnId>,
}

impl Inference {
    pub fn new(
        llm: Arc<dyn LLMClient>,
        context: SharedContext,
        interruption: Arc<InterruptionController>,
    ) -> Self {
        Self {
            llm,
            context,
            interruption,
            previous: None,
        }
    }

    /// Waits for the previous assistant turn to leave `InProgress`. Returns
    /// `false` if the session ended first.
    async fn await_previous(&self, out: &Emitter) -> bool {
        let Some(previous) = self.previous else {
            return true;
        };
        let mut settled = self.context.lock().await.subscribe_settled();
        loop {
            if self.context.lock().await.is_settled(previous) {
                return true;
            }
            tokio::select! {
                biased;
                _ = out.ended().cancelled() => return false,
                changed = settled.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    #[instrument(skip(self, out), fields(turn_id = tracing::field::Empty))]
    async fn respond(&mut self, out: &Emitter) -> Result<(), StageError> {
        if !self.await_previous(out).await {
            return Ok(());
        }
        let (turn_id, messages) = {
            let mut context = self.context.lock().await;
            let turn_id = context.allocate_turn_id();
            context
                .begin_assistant(turn_id)
                .map_err(|e| context_error(self.kind(), e))?;
            (turn_id, context.messages())
        };
        self.previous = Some(turn_id);
        tracing::Span::current().record("turn_id", turn_id);
        let cancelled = self.interruption.begin_response(turn_id);

        let mut stream = tokio::select! {
            biased;
            _ = cancelled.cancelled() => return Ok(()),
            _ = out.ended().cancelled() => return Ok(()),
            stream = self.llm.stream_chat(messages) => {
                stream.map_err(|e| remote_error(self.kind(), e))?
            }
        };

        let mut chunks = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    info!(chunks, "response interrupted");
                    return Ok(());
                }
                _ = out.ended().cancelled() => return Ok(()),
                next = stream.next() => match next {
                    Some(Ok(LLMStreamEvent::TextChunk(text))) => {
                        chunks += 1;
                        self.emit_partial(out, turn_id, text).await?;
                    }
                    Some(Err(e)) => return Err(remote_error(self.kind(), e)),
                    None => break,
                },
            }
        }

        debug!(chunks, "response complete");
        out.emit(ControlFrame::EndOfTurn(turn_id)).await
    }

    async fn emit_partial(
        &self,
        out: &Emitter,
        turn_id: TurnId,
        text: String,
    ) -> Result<(), StageError> {
        out.emit(TurnMessage {
            role: Role::Assistant,
            text,
            turn_id,
        })
        .await
    }
}

#[async_trait]
impl Stage for Inference {
    fn kind(&self) -> StageKind {
        StageKind::Inference
    }

    async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError> {
        match frame {
            Frame::TurnMessage(message) if message.role == Role::User => {
                out.emit(message).await?;
                self.respond(out).await
            }
            Frame::TurnMessage(message) if message.role == Role::System => {
                self.respond(out).await
            }
            other => out.emit(other).await,
        }
    }
}
