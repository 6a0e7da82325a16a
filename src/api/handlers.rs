//! API request handlers

use crate::auth::SessionValidator;
use crate::events::{DomainEvent, EventBus, EventEmitter};
use crate::storage::DisbursementStore;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared server state
pub struct ServerState {
    pub event_bus: EventBus,
    pub sessions: Arc<dyn SessionValidator>,
    pub store: Arc<dyn DisbursementStore>,
    /// Bearer token accepted on `/internal/*`. None means deny-by-default
    pub internal_token: Option<String>,
    /// Keepalive ping period on notification sockets
    pub ping_interval: Duration,
}

pub type SharedState = Arc<ServerState>;

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub pubsub: String,
    pub storage: bool,
}

/// Health check endpoint
///
/// Returns:
/// - 200 + `"ok"` if the store answers
/// - 503 + `"unhealthy"` otherwise (the scheduler cannot make progress)
pub async fn health(State(state): State<SharedState>) -> (StatusCode, Json<HealthResponse>) {
    let storage_ok = state.store.health_check().await.unwrap_or(false);
    let (http_status, status) = if storage_ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        http_status,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pubsub: state.event_bus.backend_name().to_string(),
            storage: storage_ok,
        }),
    )
}

// ============================================================================
// Internal event bridge
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub topic: String,
    pub subscribers: usize,
}

/// Accept a DomainEvent from an out-of-process CRUD handler and emit it.
///
/// Always 202: publishing is fire-and-forget, like in-process `emit`.
pub async fn publish_event(
    State(state): State<SharedState>,
    Json(event): Json<DomainEvent>,
) -> (StatusCode, Json<PublishResponse>) {
    let topic = event.topic();
    debug!(topic = %topic, kind = event.kind.name(), "Event received over HTTP");
    state.event_bus.emit(event);

    (
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            subscribers: state.event_bus.subscriber_count(&topic),
            topic: topic.to_string(),
        }),
    )
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
