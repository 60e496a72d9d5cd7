//! Bridges one WebSocket connection to a conversation session.
//!
//! The socket is split: a reader task turns binary frames into pipeline audio,
//! a writer task turns session output into JSON messages, and the handler
//! itself drives the session through the lifecycle controller.

use super::protocol::{ClientMessage, ServerMessage};
use crate::audio_utils::{DEFAULT_CLIENT_SAMPLE_RATE, InboundResampler, PIPELINE_SAMPLE_RATE};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, trace, warn};
use uuid::Uuid;
use voxline_core::frame::AudioChunk;
use voxline_core::lifecycle::LifecycleController;
use voxline_core::session::SessionState;
use voxline_core::transport::{ChannelSink, ConnectionHandle, OutboundEvent};

const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 256;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[instrument(name = "ws_connection", skip_all, fields(connection_id = tracing::field::Empty))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    tracing::Span::current().record("connection_id", tracing::field::display(connection_id));
    info!("New WebSocket connection.");

    let (mut socket_tx, mut socket_rx) = socket.split();

    let first = match socket_rx.next().await {
        Some(Ok(msg)) => msg,
        _ => {
            info!("Client disconnected before starting a session.");
            return;
        }
    };
    let (sample_rate, first_audio) = match first {
        Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Init { sample_rate }) => {
                (sample_rate.unwrap_or(DEFAULT_CLIENT_SAMPLE_RATE), None)
            }
            Ok(ClientMessage::End) => return,
            Err(e) => {
                reject(&mut socket_tx, format!("Invalid init message: {e}")).await;
                return;
            }
        },
        Message::Binary(data) => (DEFAULT_CLIENT_SAMPLE_RATE, Some(data)),
        Message::Close(_) => return,
        Message::Ping(_) | Message::Pong(_) => (DEFAULT_CLIENT_SAMPLE_RATE, None),
    };
    let resampler = match InboundResampler::new(sample_rate) {
        Ok(resampler) => resampler,
        Err(e) => {
            reject(&mut socket_tx, format!("Unsupported sample rate {sample_rate}: {e}")).await;
            return;
        }
    };
    debug!(sample_rate, "client audio format");

    let (sink, events) = ChannelSink::new(OUTBOUND_CAPACITY);
    let (audio_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
    let (notice_tx, notices) = mpsc::channel(8);
    let writer = tokio::spawn(write_loop(socket_tx, events, notices).in_current_span());

    let hangup = CancellationToken::new();
    let reader = tokio::spawn(
        read_loop(
            socket_rx,
            audio_tx,
            resampler,
            first_audio,
            state.lifecycle.clone(),
            connection_id,
            hangup.clone(),
        )
        .in_current_span(),
    );

    let handle = ConnectionHandle {
        id: connection_id,
        inbound,
        outbound: Arc::new(sink),
    };
    match state.lifecycle.on_connect(handle).await {
        Ok(mut info) => {
            if info.status.borrow().state == SessionState::Active {
                let _ = notice_tx
                    .send(ServerMessage::SessionStarted {
                        session_id: info.session_id,
                        connection_id,
                    })
                    .await;
            }
            // The client may have left before the session was registered.
            if hangup.is_cancelled() {
                state.lifecycle.on_disconnect(connection_id).await;
            }
            let failure = info
                .status
                .wait_for(|s| s.state.is_terminal())
                .await
                .ok()
                .and_then(|s| s.failure.clone());
            if let Some(failure) = failure {
                let _ = notice_tx
                    .send(ServerMessage::Error {
                        message: failure.reason(),
                    })
                    .await;
            }
        }
        Err(e) => {
            error!(error = %e, kind = e.kind(), "Session could not start.");
            let _ = notice_tx
                .send(ServerMessage::Error {
                    message: e.reason(),
                })
                .await;
        }
    }

    drop(notice_tx);
    reader.abort();
    let _ = writer.await;
    info!("WebSocket connection closed.");
}

async fn reject(socket_tx: &mut SplitSink<WebSocket, Message>, message: String) {
    warn!(%message, "Rejecting connection.");
    let _ = send_msg(socket_tx, ServerMessage::Error { message }).await;
    let _ = socket_tx.close().await;
}

async fn read_loop(
    mut socket_rx: SplitStream<WebSocket>,
    audio_tx: mpsc::Sender<AudioChunk>,
    mut resampler: InboundResampler,
    first_audio: Option<bytes::Bytes>,
    lifecycle: LifecycleController,
    connection_id: Uuid,
    hangup: CancellationToken,
) {
    if let Some(data) = first_audio {
        forward_audio(&audio_tx, &mut resampler, &data);
    }
    while let Some(msg) = socket_rx.next().await {
        match msg {
            Ok(Message::Binary(data)) => forward_audio(&audio_tx, &mut resampler, &data),
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::End) => {
                    info!("Client ended the session.");
                    break;
                }
                Ok(ClientMessage::Init { .. }) => warn!("Ignoring repeated init message."),
                Err(e) => warn!(error = %e, "Ignoring unparseable text message."),
            },
            Ok(Message::Close(_)) => {
                info!("Client sent close frame.");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                warn!(error = %e, "Error receiving from client WebSocket.");
                break;
            }
        }
    }
    hangup.cancel();
    lifecycle.on_disconnect(connection_id).await;
}

/// Resamples one client frame and hands it to the session. Audio that arrives
/// while the session cannot take it (provisioning, or a full queue) is dropped.
fn forward_audio(
    audio_tx: &mpsc::Sender<AudioChunk>,
    resampler: &mut InboundResampler,
    data: &[u8],
) {
    let pcm = match resampler.push(data) {
        Ok(pcm) => pcm,
        Err(e) => {
            warn!(error = %e, "Dropping audio frame that failed to resample.");
            return;
        }
    };
    if pcm.is_empty() {
        return;
    }
    match audio_tx.try_send(AudioChunk::new(pcm, PIPELINE_SAMPLE_RATE)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => trace!("Inbound audio queue full, dropping frame."),
        Err(TrySendError::Closed(_)) => trace!("Session no longer accepts audio."),
    }
}

async fn write_loop(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<OutboundEvent>,
    mut notices: mpsc::Receiver<ServerMessage>,
) {
    let mut events_open = true;
    let mut notices_open = true;
    while events_open || notices_open {
        let msg = tokio::select! {
            biased;
            notice = notices.recv(), if notices_open => match notice {
                Some(msg) => msg,
                None => {
                    notices_open = false;
                    continue;
                }
            },
            event = events.recv(), if events_open => match event {
                Some(event) => ServerMessage::from(event),
                None => {
                    events_open = false;
                    continue;
                }
            },
        };
        if let Err(e) = send_msg(&mut socket_tx, msg).await {
            debug!(error = %e, "Client socket closed.");
            break;
        }
    }
    let _ = socket_tx.close().await;
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
