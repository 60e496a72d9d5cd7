use crate::error::StageError;
use crate::frame::{ControlFrame, Frame, Role, TurnId, TurnMessage};
use crate::interruption::InterruptionController;
use crate::pipeline::{Emitter, Stage, StageKind};
use crate::transport::{OutboundEvent, OutboundSink};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{trace, warn};

/// Tail of the chain: delivers audio, text and interruption notices to the client.
pub struct OutputAdapter {
    sink: Arc<dyn OutboundSink>,
    interruption: Arc<InterruptionController>,
}

impl OutputAdapter {
    pub fn new(sink: Arc<dyn OutboundSink>, interruption: Arc<InterruptionController>) -> Self {
        Self { sink, interruption }
    }

    async fn deliver(&self, event: OutboundEvent) {
        if let Err(e) = self.sink.send(event).await {
            warn!(error = %e, "failed to deliver outbound event");
        }
    }

    fn purged(&self, turn_id: TurnId) -> bool {
        let purged = self.interruption.is_purged(turn_id);
        if purged {
            trace!(turn_id, "dropping frame of interrupted turn");
        }
        purged
    }
}

#[async_trait]
impl Stage for OutputAdapter {
    fn kind(&self) -> StageKind {
        StageKind::OutputAdapter
    }

    async fn process(&mut self, frame: Frame, _out: &Emitter) -> Result<(), StageError> {
        match frame {
            Frame::SynthesizedAudio {
                audio,
                sample_rate,
                turn_id,
            } => {
                if !self.purged(turn_id) {
                    self.deliver(OutboundEvent::Audio {
                        audio,
                        sample_rate,
                        turn_id,
                    })
                    .await;
                }
            }
            Frame::TurnMessage(TurnMessage {
                role,
                text,
                turn_id,
            }) => {
                if role != Role::Assistant || !self.purged(turn_id) {
                    self.deliver(OutboundEvent::Text {
                        role,
                        text,
                        turn_id,
                    })
                    .await;
                }
            }
            Frame::Control(ControlFrame::EndOfTurn(turn_id)) => {
                self.interruption.finish_playback(turn_id);
            }
            other => trace!(frame = other.name(), "ignored at output"),
        }
        Ok(())
    }

    async fn interrupt(&mut self, turn_id: TurnId) {
        self.deliver(OutboundEvent::Interrupted { turn_id }).await;
    }
}
