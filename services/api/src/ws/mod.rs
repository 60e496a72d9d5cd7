//! WebSocket Audio Transport
//!
//! Plays the transport role for the conversation core over a plain WebSocket:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Bridges a connection to a session, from handshake to termination.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
