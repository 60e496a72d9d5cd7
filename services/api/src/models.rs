//! API Models
//!
//! Response bodies of the REST API, with `utoipa` schemas for the OpenAPI document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use voxline_core::lifecycle::SessionSummary;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Result of probing one remote inference service.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq)]
pub struct ServiceCheck {
    pub reachable: bool,
    /// Number of models the service reports as installed.
    pub models: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceCheck {
    pub fn ok(models: usize) -> Self {
        Self {
            reachable: true,
            models,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            models: 0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq)]
pub struct HealthChecks {
    pub ollama: ServiceCheck,
    pub speaches: ServiceCheck,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
    pub active_sessions: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq)]
pub struct SessionView {
    #[schema(value_type = String, format = Uuid)]
    pub connection_id: Uuid,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(example = "active")]
    pub state: String,
}

impl From<SessionSummary> for SessionView {
    fn from(summary: SessionSummary) -> Self {
        // SessionState serializes as a bare snake_case string.
        let state = serde_json::to_value(summary.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            connection_id: summary.connection_id,
            session_id: summary.session_id,
            state,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
