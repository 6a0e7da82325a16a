//! Recurring allowance scheduling
//!
//! - `models`: schedule descriptors, period markers, cursors
//! - `evaluator`: pure "is this allowance due" decision
//! - `executor`: one pass over all allowances with atomic cursor advances
//! - `scheduler`: the fixed-tick loop driving the executor

pub mod evaluator;
pub mod executor;
pub mod models;
pub mod scheduler;

pub use evaluator::{is_due, period_marker};
pub use executor::{DisbursementExecutor, TickReport};
pub use models::{PeriodMarker, Schedule, ScheduleCursor, ScheduleError, ScheduleUnit};
pub use scheduler::Scheduler;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens the first time an allowance without a cursor is evaluated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstRunPolicy {
    /// Credit the period the allowance was created in
    Immediate,
    /// Record the current period without crediting; first credit at the next boundary
    #[default]
    NextPeriod,
}

/// Scheduler configuration (`scheduler:` section of config.yaml)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run the timer loop inside `serve`
    pub enabled: bool,
    pub tick_interval_secs: u64,
    /// Upper bound on a single allowance's compare-and-swap
    pub per_allowance_timeout_ms: u64,
    /// Allowances processed in parallel within one tick
    pub concurrency: usize,
    pub first_run: FirstRunPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 300,
            per_allowance_timeout_ms: 5_000,
            concurrency: 8,
            first_run: FirstRunPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn per_allowance_timeout(&self) -> Duration {
        Duration::from_millis(self.per_allowance_timeout_ms.max(1))
    }
}
