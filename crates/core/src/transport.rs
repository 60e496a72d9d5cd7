//! The boundary between the pipeline core and a live audio transport.
//!
//! A transport adapter hands the core one [`ConnectionHandle`] per connection:
//! inbound audio arrives on a channel and everything the session produces goes
//! out through an [`OutboundSink`].

use crate::frame::{AudioChunk, Role, TurnId};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// What a session sends back to its client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Audio {
        audio: Bytes,
        sample_rate: u32,
        turn_id: TurnId,
    },
    Text {
        role: Role,
        text: String,
        turn_id: TurnId,
    },
    /// Playback of the turn should stop; anything already buffered is stale.
    Interrupted { turn_id: TurnId },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, event: OutboundEvent) -> Result<()>;

    /// Closes the outbound direction. Further sends fail.
    async fn close(&self) -> Result<()>;
}

/// A live connection as seen by the lifecycle controller.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub inbound: mpsc::Receiver<AudioChunk>,
    pub outbound: Arc<dyn OutboundSink>,
}

/// Connection events for adapters that prefer to push events over calling the
/// controller directly.
pub enum TransportEvent {
    Connected(ConnectionHandle),
    Disconnected(ConnectionId),
}

/// An [`OutboundSink`] backed by a bounded channel.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<OutboundEvent>>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<OutboundEvent>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }
}

#[async_trait]
impl OutboundSink for ChannelSink {
    async fn send(&self, event: OutboundEvent) -> Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| anyhow!("outbound sink closed"))?;
        tx.send(event)
            .await
            .map_err(|_| anyhow!("outbound receiver dropped"))
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_until_closed() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.send(OutboundEvent::Interrupted { turn_id: 1 })
            .await
            .unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert!(sink.send(OutboundEvent::Interrupted { turn_id: 2 }).await.is_err());
        assert_eq!(rx.recv().await, Some(OutboundEvent::Interrupted { turn_id: 1 }));
        assert_eq!(rx.recv().await, None);
    }
}
