//! Auth middleware for internal Axum routes.
//!
//! Checks the shared Bearer token guarding `/internal/*`.
//! Implements deny-by-default: if no internal token is configured, all
//! requests are rejected.

use crate::api::handlers::{AppError, SharedState};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

/// Middleware that requires `Authorization: Bearer <internal_token>`.
///
/// # Behavior
/// 1. If `internal_token` is `None` → 403 Forbidden (deny-by-default)
/// 2. Missing or malformed `Authorization` header → 401
/// 3. Token mismatch → 401
pub async fn require_internal_token(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state.internal_token.as_deref().ok_or_else(|| {
        AppError::Forbidden("Internal token not configured, access denied".to_string())
    })?;

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Invalid Authorization header format".to_string()))?;

    if token != expected {
        return Err(AppError::Unauthorized("Invalid internal token".to_string()));
    }

    Ok(next.run(req).await)
}

// ============================================================================
// Tests
// ============================================================================
