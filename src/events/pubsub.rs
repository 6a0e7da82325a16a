//! Pub/sub seam between the event bus and its transport
//!
//! A `Subscription` is a stream of raw payloads for one topic. It owns a
//! `SubscriptionGuard` that keeps the topic registry's count accurate: the
//! count goes up on subscribe and back down when the subscription is
//! dropped, whatever the reason.

use super::types::Topic;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("pub/sub backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish to every current subscriber of `topic`. Succeeds with zero
    /// subscribers. Never blocks on slow subscribers.
    fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), PubSubError>;

    /// Attach a new subscriber to `topic`
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, PubSubError>;

    /// Live subscriptions on `topic` held by this process
    fn subscriber_count(&self, topic: &Topic) -> usize;

    fn backend_name(&self) -> &'static str;
}

// ============================================================================
// Topic registry
// ============================================================================

/// Per-topic subscription counts, sharded so unrelated families never
/// contend on the same lock.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    counts: DashMap<Topic, usize>,
}

impl TopicRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one more subscriber on `topic`; the returned guard undoes it
    pub fn attach(self: &Arc<Self>, topic: &Topic) -> SubscriptionGuard {
        *self.counts.entry(topic.clone()).or_insert(0) += 1;
        SubscriptionGuard {
            registry: Arc::clone(self),
            topic: topic.clone(),
            on_release: None,
        }
    }

    pub fn count(&self, topic: &Topic) -> usize {
        self.counts.get(topic).map(|c| *c).unwrap_or(0)
    }

    /// Number of topics with at least one subscriber
    pub fn active_topics(&self) -> usize {
        self.counts.len()
    }

    fn detach(&self, topic: &Topic) {
        if let Some(mut count) = self.counts.get_mut(topic) {
            *count = count.saturating_sub(1);
        }
        self.counts.remove_if(topic, |_, count| *count == 0);
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Decrements the topic count on drop, then runs the backend's release hook
pub struct SubscriptionGuard {
    registry: Arc<TopicRegistry>,
    topic: Topic,
    on_release: Option<ReleaseHook>,
}

impl SubscriptionGuard {
    pub fn on_release(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.registry.detach(&self.topic);
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("topic", &self.topic)
            .finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Stream of payloads published on one topic.
///
/// Field order matters: the payload stream (and the backend receiver inside
/// it) is dropped before the guard runs its release hook.
pub struct Subscription {
    stream: BoxStream<'static, Bytes>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(stream: BoxStream<'static, Bytes>, guard: SubscriptionGuard) -> Self {
        Self { stream, guard }
    }

    pub fn topic(&self) -> &Topic {
        &self.guard.topic
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.stream.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", self.topic())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    #[test]
    fn test_guard_counts_and_releases() {
        let registry = TopicRegistry::new();
        let topic = Topic::family(Uuid::new_v4());

        let a = registry.attach(&topic);
        let b = registry.attach(&topic);
        assert_eq!(registry.count(&topic), 2);

        drop(a);
        assert_eq!(registry.count(&topic), 1);
        drop(b);
        assert_eq!(registry.count(&topic), 0);
        assert_eq!(registry.active_topics(), 0);
    }

    #[test]
    fn test_release_hook_runs_after_detach() {
        let registry = TopicRegistry::new();
        let topic = Topic::family(Uuid::new_v4());
        let released = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&released);
        let reg = Arc::clone(&registry);
        let t = topic.clone();
        let guard = registry.attach(&topic).on_release(move || {
            assert_eq!(reg.count(&t), 0);
            flag.store(true, Ordering::SeqCst);
        });

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_subscription_yields_stream_items() {
        let registry = TopicRegistry::new();
        let topic = Topic::family(Uuid::new_v4());
        let items = futures::stream::iter(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        let mut sub = Subscription::new(items.boxed(), registry.attach(&topic));
        assert_eq!(sub.topic(), &topic);
        assert_eq!(sub.next().await, Some(Bytes::from_static(b"a")));
        assert_eq!(sub.next().await, Some(Bytes::from_static(b"b")));
        assert_eq!(sub.next().await, None);

        drop(sub);
        assert_eq!(registry.count(&topic), 0);
    }
}
