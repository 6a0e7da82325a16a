//! API route definitions

use super::handlers::{self, SharedState};
use super::ws_handlers;
use crate::auth::middleware::require_internal_token;
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // ========================================================================
    // Internal bridge for out-of-process CRUD handlers
    // ========================================================================
    let internal = Router::new()
        .route("/internal/events", post(handlers::publish_event))
        .layer(from_fn_with_state(state.clone(), require_internal_token));

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // Live notifications
        .route("/ws/notifications", get(ws_handlers::ws_notifications))
        .merge(internal)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
