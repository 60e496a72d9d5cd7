//! Context aggregators on either side of inference.

use super::context_error;
use crate::context::{ContextError, SharedContext};
use crate::error::StageError;
use crate::frame::{ControlFrame, Frame, Role, TurnMessage};
use crate::pipeline::{Emitter, Stage, StageKind};
use async_trait::async_trait;
use tracing::debug;

/// Records final user transcripts and system directives as turns.
pub struct UserTurnAggregator {
    context: SharedContext,
}

impl UserTurnAggregator {
    pub fn new(context: SharedContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Stage for UserTurnAggregator {
    fn kind(&self) -> StageKind {
        StageKind::UserTurnAggregator
    }

    async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError> {
        match frame {
            Frame::Transcript {
                text,
                is_final: true,
            } => {
                let turn_id = self.context.lock().await.push_user(text.clone());
                out.emit(TurnMessage {
                    role: Role::User,
                    text,
                    turn_id,
                })
                .await
            }
            Frame::Transcript { .. } => {
                debug!("ignoring interim transcript");
                Ok(())
            }
            Frame::TurnMessage(TurnMessage {
                role: Role::System,
                text,
                ..
            }) => {
                let turn_id = self.context.lock().await.push_system(text.clone());
                out.emit(TurnMessage {
                    role: Role::System,
                    text,
                    turn_id,
                })
                .await
            }
            other => out.emit(other).await,
        }
    }
}

/// Accumulates streamed assistant text into the assistant turn.
///
/// Text for a turn that has been truncated is swallowed here, so it never
/// reaches synthesis.
pub struct AssistantTurnAggregator {
    context: SharedContext,
}

impl AssistantTurnAggregator {
    pub fn new(context: SharedContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Stage for AssistantTurnAggregator {
    fn kind(&self) -> StageKind {
        StageKind::AssistantTurnAggregator
    }

    async fn process(&mut self, frame: Frame, out: &Emitter) -> Result<(), StageError> {
        match frame {
            Frame::TurnMessage(message) if message.role == Role::Assistant => {
                let accepted = {
                    let mut context = self.context.lock().await;
                    if context.turn(message.turn_id).is_none() {
                        context
                            .begin_assistant(message.turn_id)
                            .map_err(|e| context_error(self.kind(), e))?;
                    }
                    context
                        .append_assistant(message.turn_id, &message.text)
                        .map_err(|e| context_error(self.kind(), e))?
                };
                if accepted {
                    out.emit(message).await
                } else {
                    debug!(turn_id = message.turn_id, "dropping text for closed turn");
                    Ok(())
                }
            }
            Frame::Control(ControlFrame::EndOfTurn(turn_id)) => {
                match self.context.lock().await.complete_assistant(turn_id) {
                    // The response produced no text.
                    Ok(()) | Err(ContextError::UnknownTurn(_)) => {}
                    Err(e) => return Err(context_error(self.kind(), e)),
                }
                out.emit(ControlFrame::EndOfTurn(turn_id)).await
            }
            other => out.emit(other).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ConversationContext, TurnStatus};
    use crate::pipeline::testing;

    #[tokio::test]
    async fn test_only_final_transcripts_become_user_turns() {
        let context = ConversationContext::new("sys").shared();
        let mut stage = UserTurnAggregator::new(context.clone());
        let (out, mut rx) = testing::emitter(8);

        stage
            .process(
                Frame::Transcript {
                    text: "what's".into(),
                    is_final: false,
                },
                &out,
            )
            .await
            .unwrap();
        stage
            .process(
                Frame::Transcript {
                    text: "what's up".into(),
                    is_final: true,
                },
                &out,
            )
            .await
            .unwrap();

        let frames = testing::drain(&mut rx).await;
        assert_eq!(
            frames,
            vec![Frame::TurnMessage(TurnMessage {
                role: Role::User,
                text: "what's up".into(),
                turn_id: 1,
            })]
        );
        let ctx = context.lock().await;
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.turns()[1].role, Role::User);
    }

    #[tokio::test]
    async fn test_system_directive_is_recorded_with_its_turn_id() {
        let context = ConversationContext::new("sys").shared();
        let mut stage = UserTurnAggregator::new(context.clone());
        let (out, mut rx) = testing::emitter(8);

        stage
            .process(
                TurnMessage {
                    role: Role::System,
                    text: "Greet the user.".into(),
                    turn_id: 0,
                }
                .into(),
                &out,
            )
            .await
            .unwrap();

        let frames = testing::drain(&mut rx).await;
        assert_eq!(frames[0].name(), "turn_message");
        let Frame::TurnMessage(message) = &frames[0] else {
            unreachable!()
        };
        assert_eq!(message.turn_id, 1);
        assert_eq!(context.lock().await.turns()[1].content, "Greet the user.");
    }

    #[tokio::test]
    async fn test_assistant_text_accumulates_until_end_of_turn() {
        let context = ConversationContext::new("sys").shared();
        let turn_id = context.lock().await.allocate_turn_id();
        let mut stage = AssistantTurnAggregator::new(context.clone());
        let (out, mut rx) = testing::emitter(8);

        for text in ["Hello", " there."] {
            stage
                .process(
                    TurnMessage {
                        role: Role::Assistant,
                        text: text.into(),
                        turn_id,
                    }
                    .into(),
                    &out,
                )
                .await
                .unwrap();
        }
        stage
            .process(ControlFrame::EndOfTurn(turn_id).into(), &out)
            .await
            .unwrap();

        assert_eq!(testing::drain(&mut rx).await.len(), 3);
        let ctx = context.lock().await;
        let turn = ctx.turn(turn_id).unwrap();
        assert_eq!(turn.content, "Hello there.");
        assert_eq!(turn.status, TurnStatus::Complete);
    }

    #[tokio::test]
    async fn test_text_for_truncated_turn_is_swallowed() {
        let context = ConversationContext::new("sys").shared();
        let turn_id = {
            let mut ctx = context.lock().await;
            let id = ctx.allocate_turn_id();
            ctx.begin_assistant(id).unwrap();
            ctx.append_assistant(id, "I was").unwrap();
            ctx.truncate(id).unwrap();
            id
        };
        let mut stage = AssistantTurnAggregator::new(context.clone());
        let (out, mut rx) = testing::emitter(8);

        stage
            .process(
                TurnMessage {
                    role: Role::Assistant,
                    text: " saying".into(),
                    turn_id,
                }
                .into(),
                &out,
            )
            .await
            .unwrap();

        assert!(testing::drain(&mut rx).await.is_empty());
        let ctx = context.lock().await;
        assert_eq!(ctx.turn(turn_id).unwrap().content, "I was");
        assert_eq!(ctx.turn(turn_id).unwrap().status, TurnStatus::Truncated);
    }

    #[tokio::test]
    async fn test_end_of_turn_without_text_is_forwarded() {
        let context = ConversationContext::new("sys").shared();
        let mut stage = AssistantTurnAggregator::new(context);
        let (out, mut rx) = testing::emitter(8);

        stage
            .process(ControlFrame::EndOfTurn(7).into(), &out)
            .await
            .unwrap();
        assert_eq!(
            testing::drain(&mut rx).await,
            vec![Frame::Control(ControlFrame::EndOfTurn(7))]
        );
    }
}
