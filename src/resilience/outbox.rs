//! Durable retry outbox backed by SQLite
//!
//! Outbound payloads the connection could not confirm are parked here and
//! replayed oldest-first. Rows are never updated back to unprocessed, and
//! `AUTOINCREMENT` keeps ids from being reused after a sweep.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default replay batch size
pub const DEFAULT_BATCH_SIZE: i64 = 100;
/// Default retention before undelivered rows are dropped
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Outbox database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One persisted outbound payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryRecord {
    pub id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
}

/// Rows removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub processed_deleted: u64,
    pub expired_deleted: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.processed_deleted + self.expired_deleted
    }
}

type RecordRow = (i64, String, i64, i64, Option<i64>, i64);

pub struct RetryOutbox {
    pool: SqlitePool,
}

impl RetryOutbox {
    /// Open (creating if needed) the outbox database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OutboxError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let outbox = Self { pool };
        outbox.init_schema().await?;
        info!(path = %path.as_ref().display(), "Retry outbox opened");
        Ok(outbox)
    }

    /// Outbox living only as long as this value
    pub async fn in_memory() -> Result<Self, OutboxError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single connection that never recycles keeps the in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let outbox = Self { pool };
        outbox.init_schema().await?;
        Ok(outbox)
    }

    async fn init_schema(&self) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                processed_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_retry_messages_processed_created \
             ON retry_messages (processed, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Durable append; failures are logged and swallowed
    pub async fn enqueue(&self, message: &str) -> Option<i64> {
        match self.insert_record(message, Utc::now()).await {
            Ok(id) => {
                debug!(id, "Message parked in retry outbox");
                Some(id)
            }
            Err(e) => {
                warn!("Failed to persist message to retry outbox: {}", e);
                None
            }
        }
    }

    pub(crate) async fn insert_record(
        &self,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64, OutboxError> {
        let result = sqlx::query("INSERT INTO retry_messages (message, created_at) VALUES (?, ?)")
            .bind(message)
            .bind(created_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Unprocessed rows, oldest first
    pub async fn pending_batch(&self, limit: i64) -> Result<Vec<RetryRecord>, OutboxError> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, message, created_at, processed, processed_at, retry_count
            FROM retry_messages
            WHERE processed = 0
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(record_from_row).collect())
    }

    /// One-way transition; false when the row is unknown or already processed
    pub async fn mark_processed(&self, id: i64) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            "UPDATE retry_messages SET processed = 1, processed_at = ? \
             WHERE id = ? AND processed = 0",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Advisory counter; failures are only logged
    pub async fn increment_retry_count(&self, id: i64) {
        let result = sqlx::query("UPDATE retry_messages SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!(id, "Failed to bump retry count: {}", e);
        }
    }

    /// Delete every row older than `max_age`, delivered or not
    pub async fn sweep(&self, max_age: Duration) -> Result<SweepReport, OutboxError> {
        self.sweep_at(Utc::now(), max_age).await
    }

    pub(crate) async fn sweep_at(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<SweepReport, OutboxError> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.timestamp_millis().saturating_sub(max_age_ms);

        let mut tx = self.pool.begin().await?;
        let processed = sqlx::query(
            "DELETE FROM retry_messages WHERE processed = 1 AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let expired = sqlx::query(
            "DELETE FROM retry_messages WHERE processed = 0 AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let report = SweepReport {
            processed_deleted: processed.rows_affected(),
            expired_deleted: expired.rows_affected(),
        };
        if report.expired_deleted > 0 {
            warn!(
                expired = report.expired_deleted,
                "Dropped undelivered messages past retention"
            );
        }
        if report.total() > 0 {
            info!(
                processed = report.processed_deleted,
                expired = report.expired_deleted,
                "Retry outbox swept"
            );
        }
        Ok(report)
    }

    /// Unprocessed rows
    pub async fn size(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM retry_messages WHERE processed = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn total_count(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM retry_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get(&self, id: i64) -> Result<Option<RetryRecord>, OutboxError> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT id, message, created_at, processed, processed_at, retry_count \
             FROM retry_messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(record_from_row))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: RecordRow) -> RetryRecord {
    let (id, message, created_at, processed, processed_at, retry_count) = row;
    RetryRecord {
        id,
        message,
        created_at: millis_to_datetime(created_at),
        processed: processed != 0,
        processed_at: processed_at.map(millis_to_datetime),
        retry_count,
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_sweep_partitions_by_age() {
        let outbox = RetryOutbox::in_memory().await.unwrap();
        let now = Utc::now();
        let old = now - ChronoDuration::days(4);
        let recent = now - ChronoDuration::days(2);

        let old_done = outbox.insert_record("old-done", old).await.unwrap();
        outbox.insert_record("old-pending", old).await.unwrap();
        let recent_done = outbox.insert_record("recent-done", recent).await.unwrap();
        outbox.insert_record("recent-pending", recent).await.unwrap();
        assert!(outbox.mark_processed(old_done).await.unwrap());
        assert!(outbox.mark_processed(recent_done).await.unwrap());

        let report = outbox.sweep_at(now, DEFAULT_MAX_AGE).await.unwrap();
        assert_eq!(report.processed_deleted, 1);
        assert_eq!(report.expired_deleted, 1);
        assert_eq!(outbox.total_count().await.unwrap(), 2);

        let pending = outbox.pending_batch(DEFAULT_BATCH_SIZE).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, "recent-pending");
        assert!(outbox.get(recent_done).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_processed_is_one_way() {
        let outbox = RetryOutbox::in_memory().await.unwrap();
        let id = outbox.enqueue("payload").await.unwrap();
        assert!(outbox.mark_processed(id).await.unwrap());
        assert!(!outbox.mark_processed(id).await.unwrap());
        assert!(!outbox.mark_processed(id + 100).await.unwrap());

        let record = outbox.get(id).await.unwrap().unwrap();
        assert!(record.processed);
        assert!(record.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_count_increments() {
        let outbox = RetryOutbox::in_memory().await.unwrap();
        let id = outbox.enqueue("payload").await.unwrap();
        outbox.increment_retry_count(id).await;
        outbox.increment_retry_count(id).await;
        assert_eq!(outbox.get(id).await.unwrap().unwrap().retry_count, 2);
    }
}
