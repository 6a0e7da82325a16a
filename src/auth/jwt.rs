//! Session token encoding and decoding using HS256.
//!
//! A session token names the member, their family and their role. It is
//! presented by notification sockets (Bearer header, `session` cookie or
//! `?token=` query parameter).

use super::session::{Role, SessionIdentity};
use anyhow::{Context, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: member UUID
    pub sub: String,
    /// Family UUID
    pub family: String,
    pub role: Role,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

impl SessionClaims {
    pub fn identity(&self) -> Result<SessionIdentity> {
        Ok(SessionIdentity {
            user_uid: Uuid::parse_str(&self.sub).context("Claim `sub` is not a UUID")?,
            family_uid: Uuid::parse_str(&self.family).context("Claim `family` is not a UUID")?,
            role: self.role,
        })
    }
}

/// Encode a session token for the given identity.
pub fn encode_session_token(
    identity: &SessionIdentity,
    secret: &str,
    expiry_secs: u64,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = SessionClaims {
        sub: identity.user_uid.to_string(),
        family: identity.family_uid.to_string(),
        role: identity.role,
        iat: now,
        exp: now + expiry_secs as i64,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to encode session token")
}

/// Decode and validate a session token.
///
/// Returns the claims if the token is valid, not expired, and
/// signed with the correct secret.
pub fn decode_session_token(token: &str, secret: &str) -> Result<SessionClaims> {
    let token_data: TokenData<SessionClaims> = decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .context("Failed to decode session token")?;

    Ok(token_data.claims)
}

// ============================================================================
// Tests
// ============================================================================
