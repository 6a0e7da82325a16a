//! Test helper factories and mock state builders
//!
//! Provides convenience functions for creating test objects with sensible
//! defaults, and helpers for building `ServerState` over in-memory backends.

use crate::api::{ServerState, SharedState};
use crate::auth::{Role, StaticSessionValidator};
use crate::events::{DomainEvent, EventBus, EventEmitter, EventKind, LocalPubSub, MemberInfo};
use crate::schedule::Schedule;
use crate::storage::{Allowance, MemoryStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const INTERNAL_TOKEN: &str = "internal-test-token";

// ============================================================================
// State builders
// ============================================================================

/// ServerState over a local bus, an empty session table and a memory store
pub fn test_state() -> SharedState {
    test_state_with(Some(INTERNAL_TOKEN.to_string()))
}

pub fn test_state_with(internal_token: Option<String>) -> SharedState {
    Arc::new(ServerState {
        event_bus: EventBus::new(Arc::new(LocalPubSub::default())),
        sessions: Arc::new(StaticSessionValidator::new()),
        store: Arc::new(MemoryStore::new()),
        internal_token,
        ping_interval: Duration::from_secs(30),
    })
}

// ============================================================================
// Recording emitter
// ============================================================================

/// EventEmitter that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: DomainEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ============================================================================
// Entity factories
// ============================================================================

/// Allowance of `amount` for a fresh user in `family`
pub fn test_allowance(family: Uuid, amount: u32, schedule: Schedule) -> Allowance {
    Allowance::new(Uuid::new_v4(), family, amount, schedule).expect("valid allowance")
}

pub fn member_added(uid: Uuid) -> EventKind {
    EventKind::FamilyMemberAdded {
        user: MemberInfo {
            uid,
            name: "Test Member".to_string(),
            role: Role::Child,
        },
        by: None,
    }
}
