//! Event bus: serializes domain events onto family topics

use super::pubsub::{PubSub, PubSubError, Subscription};
use super::types::{DomainEvent, EventEmitter, Topic};
use std::sync::Arc;
use tracing::{debug, warn};

/// Event bus in front of a pub/sub backend
///
/// Fire-and-forget: emitting never blocks, never panics, never fails the
/// caller. Backend errors are logged and the event is dropped.
#[derive(Clone)]
pub struct EventBus {
    backend: Arc<dyn PubSub>,
}

impl EventBus {
    pub fn new(backend: Arc<dyn PubSub>) -> Self {
        Self { backend }
    }

    /// Subscribe to a topic (for notification sockets)
    pub async fn subscribe(&self, topic: &Topic) -> Result<Subscription, PubSubError> {
        self.backend.subscribe(topic).await
    }

    /// Number of active subscribers on a topic
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.backend.subscriber_count(topic)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, event: DomainEvent) {
        let topic = event.topic();
        let kind = event.kind.name();
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, kind, "Failed to serialize DomainEvent: {}", e);
                return;
            }
        };

        match self.backend.publish(&topic, payload.into()) {
            Ok(()) => {
                debug!(
                    topic = %topic,
                    kind,
                    subscribers = self.backend.subscriber_count(&topic),
                    "DomainEvent emitted"
                );
            }
            Err(e) => {
                warn!(topic = %topic, kind, "Failed to publish DomainEvent: {}", e);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Arc::new(super::LocalPubSub::default()))
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}
