//! Allowance, cursor and ledger persistence

pub mod memory;
pub mod models;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use models::{
    task_id_for, AdvanceOutcome, Allowance, AllowanceState, CursorAdvance, ModelError,
    Transaction, TransactionType,
};
pub use sqlite::SqliteStore;
pub use traits::DisbursementStore;
