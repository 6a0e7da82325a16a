//! Persistent records read and written by the disbursement engine

use crate::schedule::{PeriodMarker, Schedule, ScheduleCursor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("allowance amount must be greater than zero")]
    ZeroAmount,
    #[error("unknown transaction type: {0}")]
    UnknownTransactionType(String),
}

/// A recurring credit owed to one family member.
///
/// `amount` is in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    pub uid: Uuid,
    pub user_uid: Uuid,
    pub family_uid: Uuid,
    pub amount: u32,
    pub schedule: Schedule,
}

impl Allowance {
    pub fn new(
        user_uid: Uuid,
        family_uid: Uuid,
        amount: u32,
        schedule: Schedule,
    ) -> Result<Self, ModelError> {
        if amount == 0 {
            return Err(ModelError::ZeroAmount);
        }
        Ok(Self {
            uid: Uuid::new_v4(),
            user_uid,
            family_uid,
            amount,
            schedule,
        })
    }

    /// Key of this allowance's row in the cursor table
    pub fn task_id(&self) -> String {
        task_id_for(self.uid)
    }
}

pub fn task_id_for(allowance_uid: Uuid) -> String {
    format!("allowance:{}", allowance_uid)
}

/// An allowance together with its cursor, if one was ever written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowanceState {
    pub allowance: Allowance,
    pub cursor: Option<ScheduleCursor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Allowance,
    Gift,
    Request,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Allowance => write!(f, "allowance"),
            TransactionType::Gift => write!(f, "gift"),
            TransactionType::Request => write!(f, "request"),
        }
    }
}

impl FromStr for TransactionType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowance" => Ok(TransactionType::Allowance),
            "gift" => Ok(TransactionType::Gift),
            "request" => Ok(TransactionType::Request),
            other => Err(ModelError::UnknownTransactionType(other.to_string())),
        }
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub uid: Uuid,
    pub user_uid: Uuid,
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub description: String,
    pub amount: i64,
    pub time: DateTime<Utc>,
}

impl Transaction {
    /// Ledger entry for one scheduled disbursement of `allowance`
    pub fn allowance(allowance: &Allowance, time: DateTime<Utc>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            user_uid: allowance.user_uid,
            transaction_type: TransactionType::Allowance,
            description: String::new(),
            amount: i64::from(allowance.amount),
            time,
        }
    }
}

/// A compare-and-swap request against one cursor row.
///
/// `expected` is the marker the caller read (`None` when no cursor row
/// existed). The transaction, if any, is written in the same atomic unit
/// as the new cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorAdvance {
    pub task_id: String,
    pub expected: Option<PeriodMarker>,
    pub next: PeriodMarker,
    pub run_time: DateTime<Utc>,
    pub transaction: Option<Transaction>,
}

impl CursorAdvance {
    pub fn cursor(&self) -> ScheduleCursor {
        ScheduleCursor {
            task_id: self.task_id.clone(),
            last_run_marker: self.next,
            last_run_time: self.run_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The cursor moved and the transaction (if any) was recorded
    Advanced,
    /// The cursor no longer matched `expected`; nothing was written
    Conflict,
}
