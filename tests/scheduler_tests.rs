//! Disbursement integration tests against SQLite
//!
//! Two `SqliteStore` handles on one database file stand in for two replicas.
//! Run with: cargo test --test scheduler_tests

use allowance_engine::events::{Audience, DomainEvent, EventBus, EventKind, LocalPubSub, Topic};
use allowance_engine::schedule::{
    DisbursementExecutor, FirstRunPolicy, PeriodMarker, Schedule, ScheduleCursor,
    SchedulerConfig,
};
use allowance_engine::storage::{
    AdvanceOutcome, Allowance, AllowanceState, CursorAdvance, DisbursementStore, SqliteStore,
    Transaction,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc, Weekday};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

fn marker(s: &str) -> PeriodMarker {
    s.parse().unwrap()
}

async fn open_replicas(count: usize) -> (tempfile::TempDir, Vec<Arc<SqliteStore>>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("allowance.db").display());
    let mut stores = Vec::new();
    for _ in 0..count {
        stores.push(Arc::new(SqliteStore::connect(&url).await.unwrap()));
    }
    (dir, stores)
}

fn executor(store: Arc<SqliteStore>, bus: EventBus) -> DisbursementExecutor {
    DisbursementExecutor::new(store, Arc::new(bus), SchedulerConfig::default())
}

/// Weekly Monday allowance of 50, last credited 2024-01-01
async fn seed_monday_allowance(store: &SqliteStore, family: Uuid) -> Allowance {
    let allowance = Allowance::new(Uuid::new_v4(), family, 50, Schedule::weekly(Weekday::Mon))
        .unwrap();
    store.create_allowance(&allowance).await.unwrap();

    let seeded = store
        .try_advance(&CursorAdvance {
            task_id: allowance.task_id(),
            expected: None,
            next: marker("2024-01-01"),
            run_time: at(2024, 1, 1, 0),
            transaction: None,
        })
        .await
        .unwrap();
    assert_eq!(seeded, AdvanceOutcome::Advanced);
    allowance
}

#[tokio::test]
async fn test_weekly_monday_scenario() {
    let (_dir, stores) = open_replicas(1).await;
    let store = stores[0].clone();
    let bus = EventBus::new(Arc::new(LocalPubSub::default()));
    let family = Uuid::new_v4();
    let allowance = seed_monday_allowance(&store, family).await;

    let mut subscription = bus.subscribe(&Topic::family(family)).await.unwrap();
    let exec = executor(store.clone(), bus.clone());

    let report = exec.run_tick(at(2024, 1, 8, 10)).await.unwrap();
    assert_eq!(report.credited, 1);

    let ledger = store.list_transactions(Some(allowance.user_uid)).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].amount, 50);

    let cursor: ScheduleCursor = store.get_cursor(&allowance.task_id()).await.unwrap().unwrap();
    assert_eq!(cursor.last_run_marker, marker("2024-01-08"));

    let payload = tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .unwrap()
        .unwrap();
    let event: DomainEvent = serde_json::from_slice(&payload).unwrap();
    assert_eq!(event.family, family);
    assert_eq!(
        event.audience,
        Audience::MemberAndParents {
            user: allowance.user_uid
        }
    );
    assert!(matches!(event.kind, EventKind::AllowanceUpdated { .. }));

    // later the same day: nothing more to do
    let report = exec.run_tick(at(2024, 1, 8, 23)).await.unwrap();
    assert_eq!(report.credited, 0);
    assert_eq!(store.list_transactions(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_replicas_credit_exactly_once() {
    let (_dir, stores) = open_replicas(3).await;
    let family = Uuid::new_v4();
    let allowance = seed_monday_allowance(&stores[0], family).await;
    let now = at(2024, 1, 8, 10);

    let handles: Vec<_> = stores
        .iter()
        .map(|store| {
            let exec = executor(store.clone(), EventBus::default());
            tokio::spawn(async move { exec.run_tick(now).await.unwrap() })
        })
        .collect();

    let mut credited = 0;
    for handle in handles {
        credited += handle.await.unwrap().credited;
    }
    assert_eq!(credited, 1);

    let ledger = stores[1].list_transactions(None).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].user_uid, allowance.user_uid);
}

#[tokio::test]
async fn test_stale_expected_marker_conflicts_without_writing() {
    let (_dir, stores) = open_replicas(1).await;
    let store = &stores[0];
    let allowance = seed_monday_allowance(store, Uuid::new_v4()).await;

    let stale = CursorAdvance {
        task_id: allowance.task_id(),
        expected: Some(marker("2023-12-25")),
        next: marker("2024-01-08"),
        run_time: at(2024, 1, 8, 10),
        transaction: Some(Transaction::allowance(&allowance, at(2024, 1, 8, 10))),
    };
    assert_eq!(store.try_advance(&stale).await.unwrap(), AdvanceOutcome::Conflict);
    assert!(store.list_transactions(None).await.unwrap().is_empty());

    let cursor = store.get_cursor(&allowance.task_id()).await.unwrap().unwrap();
    assert_eq!(cursor.last_run_marker, marker("2024-01-01"));
}

#[tokio::test]
async fn test_first_run_policy_on_sqlite() {
    let (_dir, stores) = open_replicas(1).await;
    let store = stores[0].clone();
    let allowance = Allowance::new(Uuid::new_v4(), Uuid::new_v4(), 20, Schedule::daily()).unwrap();
    store.create_allowance(&allowance).await.unwrap();

    let deferring = executor(store.clone(), EventBus::default());
    let report = deferring.run_tick(at(2024, 3, 5, 8)).await.unwrap();
    assert_eq!(report.seeded, 1);
    assert!(store.list_transactions(None).await.unwrap().is_empty());

    let immediate = DisbursementExecutor::new(
        store.clone(),
        Arc::new(EventBus::default()),
        SchedulerConfig {
            first_run: FirstRunPolicy::Immediate,
            ..SchedulerConfig::default()
        },
    );
    // the cursor exists now, so the policy no longer matters
    let report = immediate.run_tick(at(2024, 3, 5, 20)).await.unwrap();
    assert_eq!(report.credited, 0);
    let report = immediate.run_tick(at(2024, 3, 6, 0)).await.unwrap();
    assert_eq!(report.credited, 1);
}

#[tokio::test]
async fn test_deleted_user_is_no_longer_credited() {
    let (_dir, stores) = open_replicas(1).await;
    let store = stores[0].clone();
    let allowance = seed_monday_allowance(&store, Uuid::new_v4()).await;

    assert_eq!(store.delete_allowances_for_user(allowance.user_uid).await.unwrap(), 1);
    assert!(store.get_cursor(&allowance.task_id()).await.unwrap().is_none());

    let report = executor(store.clone(), EventBus::default())
        .run_tick(at(2024, 1, 8, 10))
        .await
        .unwrap();
    assert_eq!(report.evaluated, 0);
}

/// Deletes the allowance's owner right before delegating the first advance,
/// as an admin removing the user mid-tick would.
struct DeleteBeforeAdvance {
    inner: Arc<SqliteStore>,
    user_uid: Uuid,
}

#[async_trait]
impl DisbursementStore for DeleteBeforeAdvance {
    async fn list_allowances(&self) -> anyhow::Result<Vec<AllowanceState>> {
        self.inner.list_allowances().await
    }

    async fn try_advance(&self, advance: &CursorAdvance) -> anyhow::Result<AdvanceOutcome> {
        self.inner.delete_allowances_for_user(self.user_uid).await?;
        self.inner.try_advance(advance).await
    }

    async fn get_cursor(&self, task_id: &str) -> anyhow::Result<Option<ScheduleCursor>> {
        self.inner.get_cursor(task_id).await
    }

    async fn create_allowance(&self, allowance: &Allowance) -> anyhow::Result<()> {
        self.inner.create_allowance(allowance).await
    }

    async fn delete_allowances_for_user(&self, user_uid: Uuid) -> anyhow::Result<u64> {
        self.inner.delete_allowances_for_user(user_uid).await
    }

    async fn list_transactions(&self, user_uid: Option<Uuid>) -> anyhow::Result<Vec<Transaction>> {
        self.inner.list_transactions(user_uid).await
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn test_user_deleted_between_list_and_advance_is_not_credited() {
    let (_dir, stores) = open_replicas(1).await;
    let store = stores[0].clone();
    let family = Uuid::new_v4();
    let allowance = Allowance::new(Uuid::new_v4(), family, 20, Schedule::daily()).unwrap();
    store.create_allowance(&allowance).await.unwrap();

    let bus = EventBus::new(Arc::new(LocalPubSub::default()));
    let mut subscription = bus.subscribe(&Topic::family(family)).await.unwrap();
    let racing = Arc::new(DeleteBeforeAdvance {
        inner: store.clone(),
        user_uid: allowance.user_uid,
    });
    let exec = DisbursementExecutor::new(
        racing,
        Arc::new(bus),
        SchedulerConfig {
            first_run: FirstRunPolicy::Immediate,
            ..SchedulerConfig::default()
        },
    );

    let report = exec.run_tick(at(2024, 3, 5, 8)).await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.credited, 0);
    assert_eq!(report.seeded, 0);

    assert!(store.list_transactions(None).await.unwrap().is_empty());
    assert!(store.get_cursor(&allowance.task_id()).await.unwrap().is_none());
    let next = tokio::time::timeout(Duration::from_millis(150), subscription.next()).await;
    assert!(next.is_err(), "no event expected, got {:?}", next);
}
