//! Defines the WebSocket message protocol between the browser client and the API server.
//!
//! Audio from the client travels as binary frames of PCM16 LE mono; everything
//! else is JSON text.

use crate::audio_utils;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use voxline_core::frame::{Role, TurnId};
use voxline_core::transport::OutboundEvent;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Announces the client audio format. Optional; must come first if sent.
    #[serde(rename = "init")]
    Init { sample_rate: Option<u32> },
    /// Hangs up.
    #[serde(rename = "end")]
    End,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// All models are available and the conversation is live.
    SessionStarted {
        session_id: Uuid,
        connection_id: Uuid,
    },
    /// Text of a user or assistant turn. Assistant text arrives in pieces.
    Transcript {
        role: Role,
        text: String,
        turn_id: TurnId,
    },
    /// A chunk of base64 encoded PCM16 for the assistant's voice.
    AudioChunk {
        data: String,
        sample_rate: u32,
        turn_id: TurnId,
    },
    /// The user barged in; drop any buffered audio of the turn.
    Interrupted { turn_id: TurnId },
    /// Reports a fatal error to the client.
    Error { message: String },
}

impl From<OutboundEvent> for ServerMessage {
    fn from(event: OutboundEvent) -> Self {
        match event {
            OutboundEvent::Audio {
                audio,
                sample_rate,
                turn_id,
            } => ServerMessage::AudioChunk {
                data: audio_utils::encode_pcm16(&audio),
                sample_rate,
                turn_id,
            },
            OutboundEvent::Text {
                role,
                text,
                turn_id,
            } => ServerMessage::Transcript {
                role,
                text,
                turn_id,
            },
            OutboundEvent::Interrupted { turn_id } => ServerMessage::Interrupted { turn_id },
        }
    }
}
