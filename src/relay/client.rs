//! Shared-connection relay
//!
//! One `ClientRelay` per origin. The connection slot holds at most one
//! worker task; each worker carries a generation number so that a worker
//! winding down never clears a slot that was since refilled.

use super::connector::Connector;
use super::{ReconnectPolicy, RelayConfig, RelayError, RelayMessage};
use crate::events::EventKind;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ActiveConnection {
    generation: u64,
    task: JoinHandle<()>,
}

type Slot = Arc<Mutex<Option<ActiveConnection>>>;

pub struct ClientRelay {
    origin: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    tabs: broadcast::Sender<RelayMessage>,
    slot: Slot,
    generation: AtomicU64,
    connects: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

/// Receiving end held by one tab
pub struct TabHandle {
    rx: broadcast::Receiver<RelayMessage>,
}

impl TabHandle {
    /// Next event for this tab. `None` once the relay is gone.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Tab fell behind; skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn shared_relays() -> &'static DashMap<String, Arc<ClientRelay>> {
    static SHARED: OnceLock<DashMap<String, Arc<ClientRelay>>> = OnceLock::new();
    SHARED.get_or_init(DashMap::new)
}

impl ClientRelay {
    pub fn new(
        origin: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        let (tabs, _) = broadcast::channel(config.tab_capacity.max(1));
        Arc::new(Self {
            origin: origin.into(),
            connector,
            policy: config.policy(),
            tabs,
            slot: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            connects: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    /// The process-wide relay for `origin`, created on first use.
    /// Later calls for the same origin ignore `connector` and `config`.
    pub fn shared(
        origin: &str,
        connector: Arc<dyn Connector>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        shared_relays()
            .entry(origin.to_string())
            .or_insert_with(|| Self::new(origin, connector, config))
            .clone()
    }

    /// Remove the shared relay for `origin` and shut it down
    pub async fn release_shared(origin: &str) -> bool {
        match shared_relays().remove(origin) {
            Some((_, relay)) => {
                relay.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn register_tab(&self) -> TabHandle {
        TabHandle {
            rx: self.tabs.subscribe(),
        }
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.receiver_count()
    }

    /// Connection attempts made so far
    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Whether a connection is open or being opened
    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Request-interception hook: call after every backend response.
    /// A successful response opens the shared connection if none is cached.
    pub async fn on_backend_response(&self, success: bool) {
        if !success || self.shutdown.is_cancelled() {
            return;
        }

        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(origin = %self.origin, generation, "Opening relay connection");
        let worker = Worker {
            origin: self.origin.clone(),
            generation,
            connector: Arc::clone(&self.connector),
            policy: self.policy,
            tabs: self.tabs.clone(),
            slot: Arc::clone(&self.slot),
            connects: Arc::clone(&self.connects),
            shutdown: self.shutdown.clone(),
        };
        *slot = Some(ActiveConnection {
            generation,
            task: tokio::spawn(worker.run()),
        });
    }

    /// Close the connection and refuse to open new ones
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let active = self.slot.lock().await.take();
        if let Some(active) = active {
            debug!(origin = %self.origin, generation = active.generation, "Relay shut down");
            active.task.abort();
        }
    }
}

impl Drop for ClientRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Connection worker
// ============================================================================

enum Ended {
    Closed,
    Rejected,
    Cancelled,
}

struct Worker {
    origin: String,
    generation: u64,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    tabs: broadcast::Sender<RelayMessage>,
    slot: Slot,
    connects: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let mut backoff = match self.policy {
            ReconnectPolicy::Eager { initial_backoff, .. } => initial_backoff,
            ReconnectPolicy::Lazy => Duration::ZERO,
        };

        loop {
            let ended = self.connect_and_forward(&mut backoff).await;

            let (initial_backoff, max_backoff) = match (ended, self.policy) {
                (Ended::Closed, ReconnectPolicy::Eager { initial_backoff, max_backoff }) => {
                    (initial_backoff, max_backoff)
                }
                (Ended::Cancelled, _) => return,
                _ => break,
            };

            debug!(origin = %self.origin, backoff_ms = backoff.as_millis() as u64, "Relay reconnecting");
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(max_backoff).max(initial_backoff);
        }

        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|c| c.generation == self.generation) {
            *slot = None;
        }
    }

    async fn connect_and_forward(&self, backoff: &mut Duration) -> Ended {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => return Ended::Cancelled,
            result = self.connector.connect() => result,
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!(origin = %self.origin, "Relay connect failed: {}", e);
                return Ended::Closed;
            }
        };
        info!(origin = %self.origin, generation = self.generation, "Relay connected");
        if let ReconnectPolicy::Eager { initial_backoff, .. } = self.policy {
            *backoff = initial_backoff;
        }

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ended::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(text)) => self.deliver(&text),
                Some(Err(RelayError::Rejected { code, reason })) => {
                    warn!(origin = %self.origin, code, "Relay rejected by server: {}", reason);
                    return Ended::Rejected;
                }
                Some(Err(e)) => {
                    warn!(origin = %self.origin, "Relay connection lost: {}", e);
                    return Ended::Closed;
                }
                None => {
                    debug!(origin = %self.origin, "Relay connection closed");
                    return Ended::Closed;
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        match serde_json::from_str::<EventKind>(text) {
            Ok(event) => {
                debug!(origin = %self.origin, event = event.name(), tabs = self.tabs.receiver_count(), "Relaying event");
                // no tabs registered is not an error
                let _ = self.tabs.send(RelayMessage { event });
            }
            Err(e) => warn!(origin = %self.origin, "Skipping malformed notification: {}", e),
        }
    }
}
