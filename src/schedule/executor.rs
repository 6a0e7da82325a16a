//! Disbursement executor
//!
//! One pass ("tick") over every allowance: evaluate, then credit through the
//! store's compare-and-swap. Safe to run concurrently in any number of
//! processes against the same store; only one of them can move a given
//! cursor past a given marker.

use super::evaluator::is_due;
use super::{FirstRunPolicy, SchedulerConfig};
use crate::events::{Audience, EventEmitter, EventKind};
use crate::storage::{
    AdvanceOutcome, AllowanceState, CursorAdvance, DisbursementStore, Transaction,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counters for one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub evaluated: usize,
    pub credited: usize,
    /// Cursors created without crediting (first run under `NextPeriod`)
    pub seeded: usize,
    /// Lost compare-and-swaps; another executor got there first
    pub conflicts: usize,
    /// Store errors and timeouts; retried next tick
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disbursement {
    NotDue,
    Credited,
    Seeded,
    Conflict,
    Failed,
}

pub struct DisbursementExecutor {
    store: Arc<dyn DisbursementStore>,
    emitter: Arc<dyn EventEmitter>,
    config: SchedulerConfig,
}

impl DisbursementExecutor {
    pub fn new(
        store: Arc<dyn DisbursementStore>,
        emitter: Arc<dyn EventEmitter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            emitter,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Evaluate every allowance at `now` and credit those that are due.
    ///
    /// Fails only if the allowance list itself cannot be read; per-allowance
    /// problems are counted in the report.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let states = self.store.list_allowances().await?;
        let mut report = TickReport {
            evaluated: states.len(),
            ..TickReport::default()
        };

        let outcomes: Vec<Disbursement> = futures::stream::iter(states)
            .map(|state| self.process(state, now))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Disbursement::NotDue => {}
                Disbursement::Credited => report.credited += 1,
                Disbursement::Seeded => report.seeded += 1,
                Disbursement::Conflict => report.conflicts += 1,
                Disbursement::Failed => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn process(&self, state: AllowanceState, now: DateTime<Utc>) -> Disbursement {
        let AllowanceState { allowance, cursor } = state;
        let Some(marker) = is_due(&allowance.schedule, cursor.as_ref(), now) else {
            return Disbursement::NotDue;
        };

        let seed_only = cursor.is_none() && self.config.first_run == FirstRunPolicy::NextPeriod;
        let advance = CursorAdvance {
            task_id: allowance.task_id(),
            expected: cursor.map(|c| c.last_run_marker),
            next: marker,
            run_time: now,
            transaction: (!seed_only).then(|| Transaction::allowance(&allowance, now)),
        };

        let attempt = tokio::time::timeout(
            self.config.per_allowance_timeout(),
            self.store.try_advance(&advance),
        )
        .await;

        let outcome = match attempt {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(task_id = %advance.task_id, marker = %marker, "Disbursement failed: {:#}", e);
                return Disbursement::Failed;
            }
            Err(_) => {
                // the write may have committed before the deadline hit
                if !self.landed_after_timeout(&advance).await {
                    warn!(task_id = %advance.task_id, marker = %marker, "Disbursement timed out");
                    return Disbursement::Failed;
                }
                warn!(task_id = %advance.task_id, marker = %marker, "Disbursement timed out after committing");
                AdvanceOutcome::Advanced
            }
        };

        match (outcome, advance.transaction) {
            (AdvanceOutcome::Conflict, _) => {
                debug!(task_id = %advance.task_id, marker = %marker, "Already handled by another executor");
                Disbursement::Conflict
            }
            (AdvanceOutcome::Advanced, Some(transaction)) => {
                info!(
                    task_id = %advance.task_id,
                    marker = %marker,
                    amount = allowance.amount,
                    "Allowance credited"
                );
                let family = allowance.family_uid;
                let user = allowance.user_uid;
                self.emitter.notify(
                    family,
                    Audience::MemberAndParents { user },
                    EventKind::AllowanceUpdated {
                        allowance,
                        transaction: Some(transaction),
                        by: None,
                    },
                );
                Disbursement::Credited
            }
            (AdvanceOutcome::Advanced, None) => {
                debug!(task_id = %advance.task_id, marker = %marker, "Cursor seeded");
                Disbursement::Seeded
            }
        }
    }

    /// Whether a timed-out advance was applied anyway.
    ///
    /// A credit is identified by its transaction uid in the ledger; a seed by
    /// the cursor sitting at the target marker. Read failures count as not
    /// applied, which leaves the allowance to the next tick.
    async fn landed_after_timeout(&self, advance: &CursorAdvance) -> bool {
        let timeout = self.config.per_allowance_timeout();
        match &advance.transaction {
            Some(transaction) => {
                let ledger = tokio::time::timeout(
                    timeout,
                    self.store.list_transactions(Some(transaction.user_uid)),
                )
                .await;
                matches!(ledger, Ok(Ok(rows)) if rows.iter().any(|t| t.uid == transaction.uid))
            }
            None => {
                let cursor =
                    tokio::time::timeout(timeout, self.store.get_cursor(&advance.task_id)).await;
                matches!(cursor, Ok(Ok(Some(c))) if c.last_run_marker == advance.next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{PeriodMarker, Schedule, ScheduleCursor};
    use crate::storage::MemoryStore;
    use crate::test_helpers::{test_allowance, RecordingEmitter};
    use chrono::{TimeZone, Weekday};
    use uuid::Uuid;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn config(first_run: FirstRunPolicy) -> SchedulerConfig {
        SchedulerConfig {
            first_run,
            per_allowance_timeout_ms: 200,
            ..SchedulerConfig::default()
        }
    }

    fn executor(
        store: Arc<MemoryStore>,
        emitter: Arc<RecordingEmitter>,
        first_run: FirstRunPolicy,
    ) -> DisbursementExecutor {
        DisbursementExecutor::new(store, emitter, config(first_run))
    }

    #[tokio::test]
    async fn test_weekly_credit_after_boundary() {
        let store = Arc::new(MemoryStore::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let family = Uuid::new_v4();
        let allowance = test_allowance(family, 50, Schedule::weekly(Weekday::Mon));
        store.create_allowance(&allowance).await.unwrap();
        store
            .seed_cursor(ScheduleCursor {
                task_id: allowance.task_id(),
                last_run_marker: "2024-01-01".parse().unwrap(),
                last_run_time: at(2024, 1, 1, 0),
            })
            .await;

        let exec = executor(store.clone(), emitter.clone(), FirstRunPolicy::NextPeriod);
        let report = exec.run_tick(at(2024, 1, 8, 10)).await.unwrap();
        assert_eq!(report.credited, 1);
        assert_eq!(report.evaluated, 1);

        let ledger = store.list_transactions(Some(allowance.user_uid)).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount, 50);

        let cursor = store.get_cursor(&allowance.task_id()).await.unwrap().unwrap();
        assert_eq!(cursor.last_run_marker, "2024-01-08".parse::<PeriodMarker>().unwrap());

        let events = emitter.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].family, family);
        assert_eq!(
            events[0].audience,
            Audience::MemberAndParents {
                user: allowance.user_uid
            }
        );
        match &events[0].kind {
            EventKind::AllowanceUpdated { transaction, .. } => {
                assert_eq!(transaction.as_ref().unwrap().amount, 50);
            }
            other => panic!("Expected AllowanceUpdated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_tick_in_same_period_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let allowance = test_allowance(Uuid::new_v4(), 50, Schedule::daily());
        store.create_allowance(&allowance).await.unwrap();

        let exec = executor(store.clone(), emitter.clone(), FirstRunPolicy::Immediate);
        let first = exec.run_tick(at(2024, 1, 8, 10)).await.unwrap();
        let second = exec.run_tick(at(2024, 1, 8, 22)).await.unwrap();

        assert_eq!(first.credited, 1);
        assert_eq!(second, TickReport { evaluated: 1, ..TickReport::default() });
        assert_eq!(store.list_transactions(None).await.unwrap().len(), 1);
        assert_eq!(emitter.events().len(), 1);
    }

    #[tokio::test]
    async fn test_first_run_next_period_seeds_without_credit() {
        let store = Arc::new(MemoryStore::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let allowance = test_allowance(Uuid::new_v4(), 50, Schedule::weekly(Weekday::Mon));
        store.create_allowance(&allowance).await.unwrap();

        let exec = executor(store.clone(), emitter.clone(), FirstRunPolicy::NextPeriod);
        let report = exec.run_tick(at(2024, 1, 3, 9)).await.unwrap();
        assert_eq!(report.seeded, 1);
        assert_eq!(report.credited, 0);
        assert!(store.list_transactions(None).await.unwrap().is_empty());
        assert!(emitter.events().is_empty());

        let cursor = store.get_cursor(&allowance.task_id()).await.unwrap().unwrap();
        assert_eq!(cursor.last_run_marker.to_string(), "2024-01-01");

        // first credit at the next boundary
        let report = exec.run_tick(at(2024, 1, 8, 0)).await.unwrap();
        assert_eq!(report.credited, 1);
    }

    #[tokio::test]
    async fn test_first_run_immediate_credits_current_period() {
        let store = Arc::new(MemoryStore::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let allowance = test_allowance(Uuid::new_v4(), 75, Schedule::monthly(1).unwrap());
        store.create_allowance(&allowance).await.unwrap();

        let exec = executor(store.clone(), emitter.clone(), FirstRunPolicy::Immediate);
        let report = exec.run_tick(at(2024, 2, 14, 9)).await.unwrap();
        assert_eq!(report.credited, 1);

        let cursor = store.get_cursor(&allowance.task_id()).await.unwrap().unwrap();
        assert_eq!(cursor.last_run_marker.to_string(), "2024-02-01");
    }

    #[tokio::test]
    async fn test_failure_is_counted_and_retried() {
        let store = Arc::new(MemoryStore::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let allowance = test_allowance(Uuid::new_v4(), 50, Schedule::daily());
        store.create_allowance(&allowance).await.unwrap();
        store.fail_next_advance();

        let exec = executor(store.clone(), emitter.clone(), FirstRunPolicy::Immediate);
        let report = exec.run_tick(at(2024, 1, 8, 10)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(store.list_transactions(None).await.unwrap().is_empty());
        assert!(store.get_cursor(&allowance.task_id()).await.unwrap().is_none());
        assert!(emitter.events().is_empty());

        let report = exec.run_tick(at(2024, 1, 8, 10)).await.unwrap();
        assert_eq!(report.credited, 1);
        assert_eq!(store.list_transactions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_allowance_times_out_without_stalling_others() {
        let store = Arc::new(MemoryStore::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let family = Uuid::new_v4();
        let stuck = test_allowance(family, 10, Schedule::daily());
        let healthy = test_allowance(family, 20, Schedule::daily());
        store.create_allowance(&stuck).await.unwrap();
        store.create_allowance(&healthy).await.unwrap();
        store.stall_task(stuck.task_id()).await;

        let exec = executor(store.clone(), emitter.clone(), FirstRunPolicy::Immediate);
        let report = exec.run_tick(at(2024, 1, 8, 10)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.credited, 1);

        let ledger = store.list_transactions(None).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].user_uid, healthy.user_uid);
    }

    #[tokio::test]
    async fn test_credit_committed_before_timeout_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let allowance = test_allowance(Uuid::new_v4(), 30, Schedule::daily());
        store.create_allowance(&allowance).await.unwrap();
        store.stall_after_commit(allowance.task_id()).await;

        let exec = executor(store.clone(), emitter.clone(), FirstRunPolicy::Immediate);
        let report = exec.run_tick(at(2024, 1, 8, 10)).await.unwrap();
        assert_eq!(report.credited, 1);
        assert_eq!(report.failed, 0);

        assert_eq!(store.list_transactions(None).await.unwrap().len(), 1);
        let events = emitter.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, EventKind::AllowanceUpdated { .. }));

        // the next tick sees the advanced cursor and leaves it alone
        let report = exec.run_tick(at(2024, 1, 8, 11)).await.unwrap();
        assert_eq!(report.credited, 0);
        assert_eq!(emitter.events().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_executors_credit_once() {
        let store = Arc::new(MemoryStore::new());
        let allowance = test_allowance(Uuid::new_v4(), 50, Schedule::weekly(Weekday::Mon));
        store.create_allowance(&allowance).await.unwrap();
        store
            .seed_cursor(ScheduleCursor {
                task_id: allowance.task_id(),
                last_run_marker: "2024-01-01".parse().unwrap(),
                last_run_time: at(2024, 1, 1, 0),
            })
            .await;

        let now = at(2024, 1, 8, 10);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let exec = executor(
                    store.clone(),
                    Arc::new(RecordingEmitter::new()),
                    FirstRunPolicy::NextPeriod,
                );
                tokio::spawn(async move { exec.run_tick(now).await.unwrap() })
            })
            .collect();

        let mut credited = 0;
        let mut conflicts = 0;
        for handle in handles {
            let report = handle.await.unwrap();
            credited += report.credited;
            conflicts += report.conflicts;
        }
        assert_eq!(credited, 1);
        // late executors may also see the advanced cursor and skip outright
        assert!(conflicts <= 3);
        assert_eq!(store.list_transactions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_store_reports_nothing() {
        let exec = executor(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingEmitter::new()),
            FirstRunPolicy::NextPeriod,
        );
        let report = exec.run_tick(Utc::now()).await.unwrap();
        assert_eq!(report, TickReport::default());
    }
}
