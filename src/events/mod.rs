//! Domain event system for live family notifications
//!
//! This module provides:
//! - `DomainEvent` / `EventKind`: typed events emitted after every mutation
//! - `EventBus`: serializes events onto per-family topics
//! - `PubSub`: transport seam, with `LocalPubSub` (in-process broadcast) and
//!   `NatsPubSub` (cross-replica) backends

mod bus;
pub mod local;
pub mod nats;
pub mod pubsub;
mod types;

pub use bus::EventBus;
pub use local::LocalPubSub;
pub use nats::{connect_nats, NatsPubSub};
pub use pubsub::{PubSub, PubSubError, Subscription, SubscriptionGuard, TopicRegistry};
pub use types::{
    Audience, DomainEvent, EventEmitter, EventKind, InvitationInfo, MemberInfo, RequestInfo,
    Topic,
};
