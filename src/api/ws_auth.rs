//! WebSocket authentication: token extraction from the upgrade request.
//!
//! A notification socket may present its session token in three places,
//! checked in order:
//! 1. `Authorization: Bearer <token>` header (native clients, the relay)
//! 2. `session` cookie (browsers send it automatically)
//! 3. `?token=` query parameter (clients that can set neither)
//!
//! Authentication runs right after the upgrade, so a rejected client sees a
//! close frame with a distinct code rather than an HTTP error.

use crate::auth::{AuthError, SessionIdentity, SessionValidator};
use axum::http::{header, HeaderMap};
use tracing::debug;

pub const SESSION_COOKIE_NAME: &str = "session";

/// Close code sent when the session token is missing or invalid
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;
/// Close code sent when the connection is ended by a `Logout` event
pub const CLOSE_LOGGED_OUT: u16 = 4000;
/// RFC 6455 "try again later", sent when subscribing or validating failed
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Extract the session token value from a `Cookie` header.
pub fn extract_session_token_from_cookie(cookie_header: &str) -> Option<String> {
    for part in cookie_header.split(';') {
        let trimmed = part.trim();
        if let Some(value) = trimmed.strip_prefix(&format!("{}=", SESSION_COOKIE_NAME)) {
            let token = value.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Find the session token on an upgrade request
pub fn extract_session_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_session_token_from_cookie);
    if cookie.is_some() {
        return cookie;
    }

    query_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Validate the presented token, if any
pub async fn authenticate(
    token: Option<&str>,
    validator: &dyn SessionValidator,
) -> Result<SessionIdentity, AuthError> {
    let token = token.ok_or_else(|| {
        debug!("WS auth: no session token presented");
        AuthError::Unauthenticated("missing session token".to_string())
    })?;
    validator.validate(token).await
}

/// Close code and reason for a failed authentication
pub fn close_for_auth_error(err: &AuthError) -> (u16, &'static str) {
    match err {
        AuthError::Unauthenticated(_) => (CLOSE_UNAUTHENTICATED, "unauthenticated"),
        AuthError::Unavailable(_) => (CLOSE_TRY_AGAIN_LATER, "session store unavailable"),
    }
}

// ============================================================================
// Tests
// ============================================================================
