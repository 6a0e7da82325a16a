//! Authentication module: session tokens
//!
//! Provides:
//! - HS256 session token encoding/decoding (`jwt` submodule)
//! - The `SessionValidator` seam the gateway authenticates through (`session`)
//! - Bearer-token middleware for internal HTTP routes (`middleware`)

pub mod jwt;
pub mod middleware;
pub mod session;

pub use session::{
    AuthError, JwtSessionValidator, Role, SessionIdentity, SessionValidator,
    StaticSessionValidator, UnknownRole,
};
