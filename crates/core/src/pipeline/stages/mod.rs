//! Concrete stages, in chain order.

mod aggregators;
mod inference;
mod input;
mod output;
mod recognizer;
mod synthesizer;
mod voice_gate;

pub use aggregators::{AssistantTurnAggregator, UserTurnAggregator};
pub use inference::Inference;
pub use input::InputAdapter;
pub use output::OutputAdapter;
pub use recognizer::SpeechRecognizer;
pub use synthesizer::SpeechSynthesizer;
pub use voice_gate::VoiceActivityGate;

use super::StageKind;
use crate::context::ContextError;
use crate::error::StageError;

/// Wraps a remote client failure with its full cause chain.
pub(crate) fn remote_error(stage: StageKind, err: anyhow::Error) -> StageError {
    StageError::Remote {
        stage,
        reason: format!("{err:#}"),
    }
}

pub(crate) fn context_error(stage: StageKind, err: ContextError) -> StageError {
    StageError::UnexpectedFrame {
        stage,
        frame: err.to_string(),
    }
}
