//! NATS pub/sub backend for multi-replica deployments
//!
//! Family topics map to subjects `{prefix}.family.{uid}`. A gateway on any
//! replica receives what a CRUD handler or scheduler on any other replica
//! publishes.
//!
//! Publishing is fire-and-forget but ordered: payloads go through a single
//! queue drained by one task, so two publishes on the same topic reach the
//! server in call order.

use super::pubsub::{PubSub, PubSubError, Subscription, TopicRegistry};
use super::types::Topic;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Build the NATS subject for a topic (e.g. "allowance.family.{uid}")
pub fn subject_for(prefix: &str, topic: &Topic) -> String {
    format!("{}.{}", prefix, topic.as_str().replace(':', "."))
}

#[derive(Clone)]
pub struct NatsPubSub {
    client: async_nats::Client,
    subject_prefix: String,
    registry: Arc<TopicRegistry>,
    outbound: mpsc::UnboundedSender<(String, Bytes)>,
}

impl NatsPubSub {
    /// Wrap a connected client. Spawns the publisher task, so this must be
    /// called from within a tokio runtime.
    pub fn new(client: async_nats::Client, subject_prefix: impl Into<String>) -> Self {
        let (outbound, mut queue) = mpsc::unbounded_channel::<(String, Bytes)>();
        let publisher = client.clone();
        tokio::spawn(async move {
            while let Some((subject, payload)) = queue.recv().await {
                if let Err(e) = publisher.publish(subject.clone(), payload).await {
                    warn!(subject = %subject, "Failed to publish to NATS: {}", e);
                } else {
                    debug!(subject = %subject, "Published to NATS");
                }
            }
            debug!("NATS publisher task stopped");
        });

        Self {
            client,
            subject_prefix: subject_prefix.into(),
            registry: TopicRegistry::new(),
            outbound,
        }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn subject_prefix(&self) -> &str {
        &self.subject_prefix
    }
}

#[async_trait]
impl PubSub for NatsPubSub {
    fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), PubSubError> {
        let subject = subject_for(&self.subject_prefix, topic);
        self.outbound
            .send((subject, payload))
            .map_err(|_| PubSubError::Unavailable("NATS publisher task stopped".into()))
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, PubSubError> {
        let subject = subject_for(&self.subject_prefix, topic);
        let subscriber = self.client.subscribe(subject.clone()).await.map_err(|e| {
            PubSubError::Unavailable(format!("Failed to subscribe to {}: {}", subject, e))
        })?;
        debug!(subject = %subject, "Subscribed to NATS subject");

        // Dropping the subscriber unsubscribes from the server
        let stream = subscriber.map(|message| message.payload).boxed();
        Ok(Subscription::new(stream, self.registry.attach(topic)))
    }

    fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry.count(topic)
    }

    fn backend_name(&self) -> &'static str {
        "nats"
    }
}

/// Connect to a NATS server.
pub async fn connect_nats(url: &str) -> anyhow::Result<async_nats::Client> {
    let client = async_nats::connect(url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to NATS at {}: {}", url, e))?;
    tracing::info!("Connected to NATS at {}", url);
    Ok(client)
}
