//! Voxline API Library Crate
//!
//! This library contains the web service around the conversation core:
//! configuration, application state, HTTP handlers, the WebSocket audio
//! transport, and routing. The `api` binary is a thin wrapper around this library.

pub mod audio_utils;
pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
