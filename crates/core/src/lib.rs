//! Real-time voice conversation core.
//!
//! A session pulls caller audio through a chain of stages (voice-activity
//! gating, speech-to-text, LLM inference, text-to-speech) and streams the
//! assistant's spoken reply back, with barge-in support. Sessions only start
//! once every remote model they depend on is available.

pub mod audio;
pub mod context;
pub mod error;
pub mod frame;
pub mod interruption;
pub mod lifecycle;
pub mod llm_client;
pub mod pipeline;
pub mod provisioner;
pub mod session;
pub mod speech;
pub mod transport;
pub mod vad;
