//! Session
//!
//! One live conversation: its pipeline, its conversation context and its
//! lifecycle state. A session holds at most one pipeline for its whole life.

use crate::context::SharedContext;
use crate::error::{SessionError, TeardownError};
use crate::interruption::InterruptionController;
use crate::pipeline::link::LinkSender;
use crate::pipeline::{Pipeline, StageFailure};
use crate::transport::{ConnectionId, OutboundSink};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Provisioning,
    Active,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub failure: Option<SessionError>,
}

impl SessionStatus {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            failure: None,
        }
    }
}

/// The parts of a running pipeline a session owns besides the stage tasks.
pub struct ActivePipeline {
    pub pipeline: Pipeline,
    pub context: SharedContext,
    pub interruption: Arc<InterruptionController>,
}

pub struct Session {
    id: SessionId,
    connection_id: ConnectionId,
    outbound: Arc<dyn OutboundSink>,
    status: watch::Sender<SessionStatus>,
    drain_timeout: Duration,
    active: Option<ActivePipeline>,
}

impl Session {
    pub fn new(
        id: SessionId,
        connection_id: ConnectionId,
        outbound: Arc<dyn OutboundSink>,
        status: watch::Sender<SessionStatus>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            id,
            connection_id,
            outbound,
            status,
            drain_timeout,
            active: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    fn publish(&self, state: SessionState, failure: Option<SessionError>) {
        self.status.send_replace(SessionStatus { state, failure });
    }

    /// Installs the session's pipeline and moves it to `Active`.
    ///
    /// Only a provisioning session accepts a pipeline; anything else is dropped,
    /// which aborts its stages.
    pub fn activate(&mut self, active: ActivePipeline) -> bool {
        if self.state() != SessionState::Provisioning || self.active.is_some() {
            warn!(state = ?self.state(), "refusing a second pipeline for the session");
            return false;
        }
        self.active = Some(active);
        self.publish(SessionState::Active, None);
        info!("session active");
        true
    }

    pub fn head(&self) -> Option<LinkSender> {
        self.active.as_ref().map(|a| a.pipeline.head())
    }

    pub fn context(&self) -> Option<&SharedContext> {
        self.active.as_ref().map(|a| &a.context)
    }

    pub fn interruption(&self) -> Option<&Arc<InterruptionController>> {
        self.active.as_ref().map(|a| &a.interruption)
    }

    /// Waits for a fatal stage error. Never resolves for a session without a
    /// pipeline; resolves to `None` once all stages have exited.
    pub async fn next_failure(&mut self) -> Option<StageFailure> {
        match self.active.as_mut() {
            Some(active) => active.pipeline.next_failure().await,
            None => std::future::pending().await,
        }
    }

    /// Ends the session normally. A no-op on a terminal session.
    pub async fn close(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.publish(SessionState::Closing, None);
        self.teardown().await;
        self.publish(SessionState::Closed, None);
        info!("session closed");
    }

    /// Ends the session with a failure. A no-op on a terminal session.
    pub async fn fail(&mut self, failure: SessionError) {
        if self.state().is_terminal() {
            return;
        }
        self.teardown().await;
        warn!(reason = %failure, "session failed");
        self.publish(SessionState::Failed, Some(failure));
    }

    async fn teardown(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.pipeline.shutdown(self.drain_timeout).await {
                warn!(error = %e, "pipeline teardown incomplete");
            }
        }
        if let Err(e) = self.outbound.close().await {
            let e = TeardownError::Transport(format!("{e:#}"));
            warn!(error = %e, "failed to close outbound transport");
        }
    }
}
