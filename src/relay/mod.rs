//! Client relay
//!
//! Shares one notification connection per origin across every open tab.
//! The connection is opened by the first successful backend call and each
//! received event is broadcast to all registered tabs.

mod client;
pub mod connector;

pub use client::{ClientRelay, TabHandle};
pub use connector::{Connector, MessageStream, WsConnector};

use crate::events::EventKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Server closed with an auth-related code; retrying is pointless until
    /// the session changes.
    #[error("rejected by server ({code}): {reason}")]
    Rejected { code: u16, reason: String },
}

/// One event as delivered to a tab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub event: EventKind,
}

/// What happens after the shared connection closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Stay closed until the next successful backend call
    Lazy,
    /// Retry immediately with exponential backoff
    Eager {
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectMode {
    #[default]
    Lazy,
    Eager,
}

/// Relay configuration (`relay:` section of config.yaml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub reconnect: ReconnectMode,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Per-tab buffer; a tab further behind than this skips ahead
    pub tab_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectMode::Lazy,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            tab_capacity: 64,
        }
    }
}

impl RelayConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        match self.reconnect {
            ReconnectMode::Lazy => ReconnectPolicy::Lazy,
            ReconnectMode::Eager => {
                let initial = Duration::from_millis(self.initial_backoff_ms.max(1));
                ReconnectPolicy::Eager {
                    initial_backoff: initial,
                    max_backoff: Duration::from_millis(self.max_backoff_ms).max(initial),
                }
            }
        }
    }
}
