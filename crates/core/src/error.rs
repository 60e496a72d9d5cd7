//! Error taxonomy for the conversational core.
//!
//! Provisioning and stage errors travel upward to the session-creation boundary
//! as a [`SessionError`]; teardown errors are logged and absorbed.

use crate::pipeline::StageKind;
use std::time::Duration;
use uuid::Uuid;

/// Failure to make a remote model available before a session starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("timed out after {after:?} provisioning model '{model}' on {service}")]
    Timeout {
        service: String,
        model: String,
        after: Duration,
    },
    #[error("transport error while provisioning model '{model}' on {service}: {reason}")]
    Transport {
        service: String,
        model: String,
        reason: String,
    },
    #[error("service {service} rejected model '{model}': {reason}")]
    Rejected {
        service: String,
        model: String,
        reason: String,
    },
}

impl ProvisioningError {
    /// The model identifier the failure refers to.
    pub fn model(&self) -> &str {
        match self {
            Self::Timeout { model, .. }
            | Self::Transport { model, .. }
            | Self::Rejected { model, .. } => model,
        }
    }
}

/// A fault inside a running pipeline stage. Always fatal for the session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("remote call failed in {stage}: {reason}")]
    Remote { stage: StageKind, reason: String },
    #[error("decode failure in {stage}: {reason}")]
    Decode { stage: StageKind, reason: String },
    #[error("unexpected frame in {stage}: {frame}")]
    UnexpectedFrame { stage: StageKind, frame: String },
    /// The downstream stage is gone. Not reported as a failure on its own.
    #[error("downstream link closed")]
    DownstreamClosed,
}

/// A resource release that failed while a session was shutting down.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TeardownError {
    #[error("{stage} failed to release resources: {reason}")]
    Release { stage: StageKind, reason: String },
    #[error("pipeline did not drain within {0:?}")]
    DrainTimeout(Duration),
    #[error("failed to close transport: {0}")]
    Transport(String),
}

/// The typed failure reported to the session-creation boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),
    #[error("stage {stage} failed: {reason}")]
    Stage { stage: StageKind, reason: String },
    #[error("connection {0} already has a live session")]
    AlreadyConnected(Uuid),
}

impl SessionError {
    /// Human-readable reason, suitable for sending to a client.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Stable machine tag for the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provisioning(_) => "provisioning",
            Self::Stage { .. } => "stage",
            Self::AlreadyConnected(_) => "already_connected",
        }
    }
}
