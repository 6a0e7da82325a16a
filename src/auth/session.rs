//! Session validation seam used by the notification gateway.

use super::jwt::decode_session_token;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Parent,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parent" => Ok(Role::Parent),
            "child" => Ok(Role::Child),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Who is on the other end of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_uid: Uuid,
    pub family_uid: Uuid,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<SessionIdentity, AuthError>;
}

/// Validates HS256 session tokens issued with the shared secret
pub struct JwtSessionValidator {
    secret: String,
}

impl JwtSessionValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl SessionValidator for JwtSessionValidator {
    async fn validate(&self, token: &str) -> Result<SessionIdentity, AuthError> {
        let claims = decode_session_token(token, &self.secret)
            .map_err(|e| AuthError::Unauthenticated(format!("{:#}", e)))?;
        let identity = claims
            .identity()
            .map_err(|e| AuthError::Unauthenticated(format!("{:#}", e)))?;
        debug!(user = %identity.user_uid, family = %identity.family_uid, "Session token accepted");
        Ok(identity)
    }
}

/// In-memory token table. Empty by default, which rejects everyone.
#[derive(Debug, Default)]
pub struct StaticSessionValidator {
    sessions: DashMap<String, SessionIdentity>,
}

impl StaticSessionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, identity: SessionIdentity) {
        self.sessions.insert(token.into(), identity);
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }
}

#[async_trait]
impl SessionValidator for StaticSessionValidator {
    async fn validate(&self, token: &str) -> Result<SessionIdentity, AuthError> {
        self.sessions
            .get(token)
            .map(|identity| *identity)
            .ok_or_else(|| AuthError::Unauthenticated("unknown session".into()))
    }
}
