//! In-process pub/sub backend
//!
//! One `tokio::sync::broadcast` channel per topic, created on first
//! subscribe and pruned when its last subscription goes away. Broadcast
//! channels preserve send order, so per-topic order holds for every
//! subscriber.

use super::pubsub::{PubSub, PubSubError, Subscription, TopicRegistry};
use super::types::Topic;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

/// Default per-topic channel capacity
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct LocalPubSub {
    senders: Arc<DashMap<Topic, broadcast::Sender<Bytes>>>,
    registry: Arc<TopicRegistry>,
    capacity: usize,
}

impl LocalPubSub {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: Arc::new(DashMap::new()),
            registry: TopicRegistry::new(),
            capacity: capacity.max(1),
        }
    }

    /// Topics that currently own a channel
    pub fn channel_count(&self) -> usize {
        self.senders.len()
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), PubSubError> {
        match self.senders.get(topic) {
            Some(sender) => match sender.send(payload) {
                Ok(n) => debug!(topic = %topic, subscribers = n, "Payload published"),
                Err(_) => debug!(topic = %topic, "Last subscriber left during publish"),
            },
            None => {
                // No subscribers: expected, nobody is listening
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, PubSubError> {
        let receiver = self
            .senders
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let senders = Arc::clone(&self.senders);
        let pruned = topic.clone();
        let guard = self.registry.attach(topic).on_release(move || {
            senders.remove_if(&pruned, |_, sender| sender.receiver_count() == 0);
        });

        let lag_topic = topic.clone();
        let stream = BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let result = match item {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        warn!(topic = %lag_topic, skipped = n, "Subscriber lagged, events dropped");
                        None
                    }
                };
                futures::future::ready(result)
            })
            .boxed();

        Ok(Subscription::new(stream, guard))
    }

    fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry.count(topic)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
