//! Transport seam for the client relay
//!
//! `Connector` opens one notification stream; `WsConnector` is the real
//! implementation over tokio-tungstenite. Tests substitute a channel-backed
//! connector.

use super::RelayError;
use crate::api::ws_auth::{CLOSE_LOGGED_OUT, CLOSE_UNAUTHENTICATED};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Text frames from one open connection, in arrival order.
/// The stream ends when the server closes the socket.
pub type MessageStream = BoxStream<'static, Result<String, RelayError>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<MessageStream, RelayError>;
}

/// Connects to the gateway's `/ws/notifications` endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    token: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<MessageStream, RelayError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RelayError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        debug!(url = %self.url, "Relay connected");

        let frames = socket.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(Some(close))) => {
                    let code = u16::from(close.code);
                    if code == CLOSE_UNAUTHENTICATED || code == CLOSE_LOGGED_OUT {
                        Some(Err(RelayError::Rejected {
                            code,
                            reason: close.reason.as_str().to_owned(),
                        }))
                    } else {
                        debug!(code, "Relay connection closed by server");
                        None
                    }
                }
                Ok(_) => None,
                Err(e) => Some(Err(RelayError::Transport(e.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}
