//! SQLite implementation of DisbursementStore (sqlx)
//!
//! The compare-and-swap is a conditional write inside a sqlx transaction:
//! `INSERT .. SELECT .. WHERE EXISTS .. ON CONFLICT DO NOTHING` for a first
//! run, so a deleted allowance never gets a cursor, and `UPDATE .. WHERE
//! last_run_marker = ?` afterwards. Anything other than exactly one
//! affected row rolls back as a conflict. Markers are stored as
//! `YYYY-MM-DD` text, so the column sorts the same way markers compare.

use super::models::*;
use super::traits::DisbursementStore;
use crate::schedule::{Schedule, ScheduleCursor, ScheduleUnit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and set up the schema
    pub async fn connect(url: &str) -> Result<Self> {
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            Sqlite::create_database(url)
                .await
                .with_context(|| format!("Failed to create database {}", url))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        Self::setup_schema(&pool).await?;
        info!(url = %url, "SQLite store ready");
        Ok(Self { pool })
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite")?;
        Self::setup_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn setup_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS allowances (
                uid TEXT PRIMARY KEY,
                user_uid TEXT NOT NULL,
                family_uid TEXT NOT NULL,
                amount INTEGER NOT NULL CHECK (amount > 0),
                schedule_unit TEXT NOT NULL,
                schedule_anchor INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedule_cursors (
                task_id TEXT PRIMARY KEY,
                last_run_marker TEXT NOT NULL,
                last_run_time TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                uid TEXT PRIMARY KEY,
                user_uid TEXT NOT NULL,
                transaction_type TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                amount INTEGER NOT NULL,
                time TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_user_time
            ON transactions(user_uid, time);
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).with_context(|| format!("Invalid uuid in column {}", column))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp {}", raw))?
        .with_timezone(&Utc))
}

fn row_to_state(row: &SqliteRow) -> Result<AllowanceState> {
    let unit: ScheduleUnit = row.try_get::<String, _>("schedule_unit")?.parse()?;
    let anchor: i64 = row.try_get("schedule_anchor")?;
    let amount: i64 = row.try_get("amount")?;
    let allowance = Allowance {
        uid: parse_uuid(row, "uid")?,
        user_uid: parse_uuid(row, "user_uid")?,
        family_uid: parse_uuid(row, "family_uid")?,
        amount: u32::try_from(amount).context("Allowance amount out of range")?,
        schedule: Schedule::new(unit, u32::try_from(anchor).context("Anchor out of range")?)?,
    };

    let marker: Option<String> = row.try_get("last_run_marker")?;
    let cursor = match marker {
        Some(marker) => {
            let time: String = row.try_get("last_run_time")?;
            Some(ScheduleCursor {
                task_id: allowance.task_id(),
                last_run_marker: marker.parse()?,
                last_run_time: parse_time(&time)?,
            })
        }
        None => None,
    };

    Ok(AllowanceState { allowance, cursor })
}

fn row_to_transaction(row: &SqliteRow) -> Result<Transaction> {
    let time: String = row.try_get("time")?;
    Ok(Transaction {
        uid: parse_uuid(row, "uid")?,
        user_uid: parse_uuid(row, "user_uid")?,
        transaction_type: row.try_get::<String, _>("transaction_type")?.parse()?,
        description: row.try_get("description")?,
        amount: row.try_get("amount")?,
        time: parse_time(&time)?,
    })
}

#[async_trait]
impl DisbursementStore for SqliteStore {
    async fn list_allowances(&self) -> Result<Vec<AllowanceState>> {
        let rows = sqlx::query(
            r#"
            SELECT a.uid, a.user_uid, a.family_uid, a.amount,
                   a.schedule_unit, a.schedule_anchor,
                   c.last_run_marker, c.last_run_time
            FROM allowances a
            LEFT JOIN schedule_cursors c ON c.task_id = 'allowance:' || a.uid
            ORDER BY a.uid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_state).collect()
    }

    async fn try_advance(&self, advance: &CursorAdvance) -> Result<AdvanceOutcome> {
        let mut tx = self.pool.begin().await?;
        let next = advance.next.to_string();
        let run_time = advance.run_time.to_rfc3339();

        let affected = match &advance.expected {
            None => sqlx::query(
                r#"
                INSERT INTO schedule_cursors (task_id, last_run_marker, last_run_time)
                SELECT ?, ?, ?
                WHERE EXISTS (SELECT 1 FROM allowances WHERE 'allowance:' || uid = ?)
                ON CONFLICT(task_id) DO NOTHING
                "#,
            )
            .bind(&advance.task_id)
            .bind(&next)
            .bind(&run_time)
            .bind(&advance.task_id)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            Some(expected) => sqlx::query(
                r#"
                UPDATE schedule_cursors
                SET last_run_marker = ?, last_run_time = ?
                WHERE task_id = ? AND last_run_marker = ?
                "#,
            )
            .bind(&next)
            .bind(&run_time)
            .bind(&advance.task_id)
            .bind(expected.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        if affected != 1 {
            tx.rollback().await?;
            debug!(task_id = %advance.task_id, "Cursor moved underneath us");
            return Ok(AdvanceOutcome::Conflict);
        }

        if let Some(t) = &advance.transaction {
            sqlx::query(
                r#"
                INSERT INTO transactions (uid, user_uid, transaction_type, description, amount, time)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(t.uid.to_string())
            .bind(t.user_uid.to_string())
            .bind(t.transaction_type.to_string())
            .bind(&t.description)
            .bind(t.amount)
            .bind(t.time.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(AdvanceOutcome::Advanced)
    }

    async fn get_cursor(&self, task_id: &str) -> Result<Option<ScheduleCursor>> {
        let row = sqlx::query(
            "SELECT task_id, last_run_marker, last_run_time FROM schedule_cursors WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let marker: String = row.try_get("last_run_marker")?;
                let time: String = row.try_get("last_run_time")?;
                Ok(Some(ScheduleCursor {
                    task_id: row.try_get("task_id")?,
                    last_run_marker: marker.parse()?,
                    last_run_time: parse_time(&time)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_allowance(&self, allowance: &Allowance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO allowances (uid, user_uid, family_uid, amount, schedule_unit, schedule_anchor)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(allowance.uid.to_string())
        .bind(allowance.user_uid.to_string())
        .bind(allowance.family_uid.to_string())
        .bind(i64::from(allowance.amount))
        .bind(allowance.schedule.unit().to_string())
        .bind(i64::from(allowance.schedule.anchor()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create allowance {}", allowance.uid))?;
        Ok(())
    }

    async fn delete_allowances_for_user(&self, user_uid: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM schedule_cursors
            WHERE task_id IN (SELECT 'allowance:' || uid FROM allowances WHERE user_uid = ?)
            "#,
        )
        .bind(user_uid.to_string())
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM allowances WHERE user_uid = ?")
            .bind(user_uid.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    async fn list_transactions(&self, user_uid: Option<Uuid>) -> Result<Vec<Transaction>> {
        let rows = match user_uid {
            Some(user) => {
                sqlx::query(
                    "SELECT * FROM transactions WHERE user_uid = ? ORDER BY time, rowid",
                )
                .bind(user.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM transactions ORDER BY time, rowid")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_transaction).collect()
    }

    async fn health_check(&self) -> Result<bool> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
