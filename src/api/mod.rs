//! HTTP and WebSocket surface of the notification gateway

pub mod handlers;
pub mod routes;
pub mod ws_auth;
pub mod ws_handlers;

pub use handlers::{AppError, ServerState, SharedState};
pub use routes::create_router;
