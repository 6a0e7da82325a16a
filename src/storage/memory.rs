//! In-memory implementation of DisbursementStore.
//!
//! All tables sit behind a single `tokio::sync::RwLock`, so a cursor
//! advance and its ledger insert happen inside one critical section with
//! no await point in between. Also carries fault hooks used by tests.

use super::models::*;
use super::traits::DisbursementStore;
use crate::schedule::ScheduleCursor;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    allowances: HashMap<Uuid, Allowance>,
    cursors: HashMap<String, ScheduleCursor>,
    transactions: Vec<Transaction>,
}

/// Store for tests and single-process development.
///
/// # Example
///
/// ```rust
/// use allowance_engine::schedule::Schedule;
/// use allowance_engine::storage::{Allowance, DisbursementStore, MemoryStore};
/// use uuid::Uuid;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// let allowance = Allowance::new(Uuid::new_v4(), Uuid::new_v4(), 50, Schedule::daily()).unwrap();
/// store.create_allowance(&allowance).await.unwrap();
///
/// let states = store.list_allowances().await.unwrap();
/// assert_eq!(states.len(), 1);
/// assert!(states[0].cursor.is_none());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_next_advance: AtomicBool,
    stalled_tasks: RwLock<HashSet<String>>,
    stalled_after_commit: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `try_advance` fail after its cursor check passed,
    /// as if the ledger insert had failed.
    pub fn fail_next_advance(&self) {
        self.fail_next_advance.store(true, Ordering::SeqCst);
    }

    /// Make every `try_advance` for `task_id` hang until the caller gives up
    pub async fn stall_task(&self, task_id: impl Into<String>) {
        self.stalled_tasks.write().await.insert(task_id.into());
    }

    /// Make every `try_advance` for `task_id` apply its writes and then hang
    pub async fn stall_after_commit(&self, task_id: impl Into<String>) {
        self.stalled_after_commit.write().await.insert(task_id.into());
    }

    /// Insert a cursor row directly, bypassing the compare-and-swap
    pub async fn seed_cursor(&self, cursor: ScheduleCursor) {
        self.tables
            .write()
            .await
            .cursors
            .insert(cursor.task_id.clone(), cursor);
    }
}

#[async_trait]
impl DisbursementStore for MemoryStore {
    async fn list_allowances(&self) -> Result<Vec<AllowanceState>> {
        let tables = self.tables.read().await;
        let mut states: Vec<AllowanceState> = tables
            .allowances
            .values()
            .map(|allowance| AllowanceState {
                cursor: tables.cursors.get(&allowance.task_id()).cloned(),
                allowance: allowance.clone(),
            })
            .collect();
        states.sort_by_key(|s| s.allowance.uid);
        Ok(states)
    }

    async fn try_advance(&self, advance: &CursorAdvance) -> Result<AdvanceOutcome> {
        if self.stalled_tasks.read().await.contains(&advance.task_id) {
            futures::future::pending::<()>().await;
        }

        let mut tables = self.tables.write().await;
        let current = tables
            .cursors
            .get(&advance.task_id)
            .map(|c| c.last_run_marker);
        if current != advance.expected {
            return Ok(AdvanceOutcome::Conflict);
        }
        // the allowance may have been deleted since it was listed
        if !tables
            .allowances
            .values()
            .any(|a| a.task_id() == advance.task_id)
        {
            return Ok(AdvanceOutcome::Conflict);
        }

        if self.fail_next_advance.swap(false, Ordering::SeqCst) {
            return Err(anyhow!(
                "injected ledger failure for {}",
                advance.task_id
            ));
        }

        if let Some(transaction) = &advance.transaction {
            tables.transactions.push(transaction.clone());
        }
        tables
            .cursors
            .insert(advance.task_id.clone(), advance.cursor());
        drop(tables);

        if self.stalled_after_commit.read().await.contains(&advance.task_id) {
            futures::future::pending::<()>().await;
        }
        Ok(AdvanceOutcome::Advanced)
    }

    async fn get_cursor(&self, task_id: &str) -> Result<Option<ScheduleCursor>> {
        Ok(self.tables.read().await.cursors.get(task_id).cloned())
    }

    async fn create_allowance(&self, allowance: &Allowance) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.allowances.contains_key(&allowance.uid) {
            return Err(anyhow!("allowance {} already exists", allowance.uid));
        }
        tables.allowances.insert(allowance.uid, allowance.clone());
        Ok(())
    }

    async fn delete_allowances_for_user(&self, user_uid: Uuid) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let removed: Vec<Uuid> = tables
            .allowances
            .values()
            .filter(|a| a.user_uid == user_uid)
            .map(|a| a.uid)
            .collect();
        for uid in &removed {
            tables.allowances.remove(uid);
            tables.cursors.remove(&task_id_for(*uid));
        }
        Ok(removed.len() as u64)
    }

    async fn list_transactions(&self, user_uid: Option<Uuid>) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .iter()
            .filter(|t| user_uid.map_or(true, |u| t.user_uid == u))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
