//! Frames: the typed units that flow between pipeline stages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Session-unique identifier of a conversation turn.
pub type TurnId = u64;

/// Who a turn belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Marker set by the voice-activity gate on the chunk where speech starts or stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechBoundary {
    Started,
    Stopped,
}

/// A chunk of raw inbound audio: PCM16 little-endian mono.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Bytes,
    pub sample_rate: u32,
    /// Offset from the start of the session's inbound stream.
    pub timestamp: Duration,
    pub boundary: Option<SpeechBoundary>,
}

impl AudioChunk {
    pub fn new(samples: Bytes, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp: Duration::ZERO,
            boundary: None,
        }
    }

    /// Number of PCM16 samples in the chunk.
    pub fn sample_count(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / self.sample_rate as f64)
    }

    pub fn with_boundary(mut self, boundary: Option<SpeechBoundary>) -> Self {
        self.boundary = boundary;
        self
    }
}

/// A piece of conversational text attributed to a role and a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnMessage {
    pub role: Role,
    pub text: String,
    pub turn_id: TurnId,
}

/// Out-of-band pipeline signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// Ends an assistant response. Travels in order with the text it terminates.
    EndOfTurn(TurnId),
    /// The session is ending; stages release their resources and exit.
    SessionEnd,
    /// The user barged in on the given assistant turn; stages drop its state.
    Interrupt(TurnId),
}

impl ControlFrame {
    /// Priority control frames skip the bounded data queue of each link.
    pub fn is_priority(&self) -> bool {
        matches!(self, ControlFrame::SessionEnd | ControlFrame::Interrupt(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    AudioChunk(AudioChunk),
    Transcript { text: String, is_final: bool },
    TurnMessage(TurnMessage),
    SynthesizedAudio {
        audio: Bytes,
        sample_rate: u32,
        turn_id: TurnId,
    },
    Control(ControlFrame),
}

impl Frame {
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Control(_))
    }

    /// The assistant turn a frame belongs to, if any.
    pub fn turn_id(&self) -> Option<TurnId> {
        match self {
            Frame::TurnMessage(TurnMessage {
                role: Role::Assistant,
                turn_id,
                ..
            })
            | Frame::SynthesizedAudio { turn_id, .. }
            | Frame::Control(ControlFrame::EndOfTurn(turn_id)) => Some(*turn_id),
            _ => None,
        }
    }

    /// Short variant name, used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::AudioChunk(_) => "audio_chunk",
            Frame::Transcript { .. } => "transcript",
            Frame::TurnMessage(_) => "turn_message",
            Frame::SynthesizedAudio { .. } => "synthesized_audio",
            Frame::Control(ControlFrame::EndOfTurn(_)) => "end_of_turn",
            Frame::Control(ControlFrame::SessionEnd) => "session_end",
            Frame::Control(ControlFrame::Interrupt(_)) => "interrupt",
        }
    }
}

impl From<ControlFrame> for Frame {
    fn from(control: ControlFrame) -> Self {
        Frame::Control(control)
    }
}

impl From<AudioChunk> for Frame {
    fn from(chunk: AudioChunk) -> Self {
        Frame::AudioChunk(chunk)
    }
}

impl From<TurnMessage> for Frame {
    fn from(message: TurnMessage) -> Self {
        Frame::TurnMessage(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_chunk_duration() {
        let chunk = AudioChunk::new(Bytes::from(vec![0u8; 3200]), 16000);
        assert_eq!(chunk.sample_count(), 1600);
        assert_eq!(chunk.duration(), Duration::from_millis(100));

        let silent = AudioChunk::new(Bytes::new(), 0);
        assert_eq!(silent.duration(), Duration::ZERO);
    }

    #[test]
    fn test_control_priority() {
        assert!(ControlFrame::SessionEnd.is_priority());
        assert!(ControlFrame::Interrupt(3).is_priority());
        assert!(!ControlFrame::EndOfTurn(3).is_priority());
    }

    #[test]
    fn test_role_display_and_serialization() {
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }

    #[test]
    fn test_turn_id_only_for_assistant_frames() {
        let assistant = Frame::from(TurnMessage {
            role: Role::Assistant,
            text: "Hi".into(),
            turn_id: 4,
        });
        assert_eq!(assistant.turn_id(), Some(4));
        let user = Frame::from(TurnMessage {
            role: Role::User,
            text: "Hi".into(),
            turn_id: 3,
        });
        assert_eq!(user.turn_id(), None);
        assert_eq!(Frame::from(ControlFrame::EndOfTurn(4)).turn_id(), Some(4));
        assert_eq!(Frame::from(ControlFrame::Interrupt(4)).turn_id(), None);
    }

    #[test]
    fn test_frame_names() {
        assert_eq!(Frame::from(ControlFrame::SessionEnd).name(), "session_end");
        assert_eq!(
            Frame::Transcript {
                text: "hi".into(),
                is_final: true
            }
            .name(),
            "transcript"
        );
    }
}
