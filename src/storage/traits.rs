//! DisbursementStore trait definition
//!
//! Abstract interface over allowance, cursor and ledger persistence.
//! Implemented by the in-memory store (tests, development) and SQLite.

use super::models::*;
use crate::schedule::ScheduleCursor;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait DisbursementStore: Send + Sync {
    // ========================================================================
    // Scheduler operations
    // ========================================================================

    /// All allowances joined with their cursors
    async fn list_allowances(&self) -> Result<Vec<AllowanceState>>;

    /// Atomically record `advance.transaction` and move the cursor to
    /// `advance.next`, provided the stored marker still equals
    /// `advance.expected`. Either both writes happen or neither does.
    async fn try_advance(&self, advance: &CursorAdvance) -> Result<AdvanceOutcome>;

    /// Read one cursor row
    async fn get_cursor(&self, task_id: &str) -> Result<Option<ScheduleCursor>>;

    // ========================================================================
    // CRUD-side operations
    // ========================================================================

    async fn create_allowance(&self, allowance: &Allowance) -> Result<()>;

    /// Remove every allowance (and its cursor) owned by a user.
    /// Returns the number of allowances removed.
    async fn delete_allowances_for_user(&self, user_uid: Uuid) -> Result<u64>;

    /// Ledger entries, oldest first, optionally for one user
    async fn list_transactions(&self, user_uid: Option<Uuid>) -> Result<Vec<Transaction>>;

    /// Cheap connectivity check for the health endpoint
    async fn health_check(&self) -> Result<bool>;
}
