//! Axum Handlers for the REST API
//!
//! Health and session inspection endpoints. Sessions themselves are created by
//! the WebSocket handler. Uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;
use voxline_core::provisioner::catalog::ModelCatalog;

use crate::{
    models::{ErrorResponse, HealthChecks, HealthResponse, HealthStatus, ServiceCheck, SessionView},
    state::AppState,
};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
        }
    }
}

async fn check_catalog(catalog: &dyn ModelCatalog) -> ServiceCheck {
    let service = catalog.base_url();
    match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, catalog.list_models()).await {
        Ok(Ok(models)) => ServiceCheck::ok(models.len()),
        Ok(Err(e)) => {
            warn!(%service, error = %e, "health check failed");
            ServiceCheck::failed(e.to_string())
        }
        Err(_) => {
            warn!(%service, "health check timed out");
            ServiceCheck::failed(format!("timed out after {HEALTH_CHECK_TIMEOUT:?}"))
        }
    }
}

/// Report reachability of the inference services and the number of live sessions.
///
/// An unreachable service only degrades the report; running sessions are unaffected.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (ollama, speaches) = tokio::join!(
        check_catalog(state.ollama.as_ref()),
        check_catalog(state.speaches.as_ref())
    );
    let status = if ollama.reachable && speaches.reachable {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    Json(HealthResponse {
        status,
        checks: HealthChecks { ollama, speaches },
        active_sessions: state.lifecycle.active_sessions().len(),
        timestamp: Utc::now(),
    })
}

/// List all live sessions.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "List of live sessions", body = [SessionView])
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionView>> {
    Json(
        state
            .lifecycle
            .active_sessions()
            .into_iter()
            .map(SessionView::from)
            .collect(),
    )
}

/// Get the live session of a connection.
#[utoipa::path(
    get,
    path = "/sessions/{connection_id}",
    responses(
        (status = 200, description = "Session details", body = SessionView),
        (status = 404, description = "No live session for the connection", body = ErrorResponse)
    ),
    params(
        ("connection_id" = Uuid, Path, description = "Connection ID")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    state
        .lifecycle
        .active_sessions()
        .into_iter()
        .find(|s| s.connection_id == connection_id)
        .map(|s| Json(SessionView::from(s)))
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "No live session for connection '{}'",
                connection_id
            ))
        })
}
