//! SQLite-backed `OutboxStore`, schema and pooling modeled on a
//! production outbox repository's SQLite implementation: millisecond
//! timestamp columns, a status+created_at index for `get_pending`, and
//! parameterized queries built with `sqlx::QueryBuilder` rather than
//! hand-interpolated SQL.

use std::time::Duration;

use async_trait::async_trait;
use catga_common::MessageId;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::model::{OutboxRecord, OutboxStatus};
use crate::store::OutboxStore;

pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init_schema().await?;
        tracing::debug!("sqlite outbox store ready");
        Ok(store)
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catga_outbox (
                message_id     INTEGER PRIMARY KEY,
                message_type   TEXT NOT NULL,
                payload        BLOB NOT NULL,
                correlation_id INTEGER,
                metadata       TEXT,
                status         TEXT NOT NULL,
                retry_count    INTEGER NOT NULL DEFAULT 0,
                max_retries    INTEGER NOT NULL,
                last_error     TEXT,
                created_at_ms  INTEGER NOT NULL,
                updated_at_ms  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_catga_outbox_status_created \
             ON catga_outbox (status, created_at_ms)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> OutboxRecord {
        let status_str: String = row.get("status");
        OutboxRecord {
            message_id: MessageId::new(row.get::<i64, _>("message_id") as u64),
            message_type: row.get("message_type"),
            payload: row.get("payload"),
            correlation_id: row
                .get::<Option<i64>, _>("correlation_id")
                .map(|v| catga_common::CorrelationId(v as u64)),
            metadata: row.get("metadata"),
            status: OutboxStatus::parse(&status_str).unwrap_or(OutboxStatus::Pending),
            retry_count: row.get::<i64, _>("retry_count") as u32,
            max_retries: row.get::<i64, _>("max_retries") as u32,
            last_error: row.get("last_error"),
            created_at: millis_to_datetime(row.get("created_at_ms")),
            updated_at: millis_to_datetime(row.get("updated_at_ms")),
        }
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn add(&self, record: OutboxRecord) -> Result<()> {
        if record.message_id.get() == 0 {
            return Err(crate::error::OutboxError::ZeroMessageId);
        }
        sqlx::query(
            r#"
            INSERT INTO catga_outbox
                (message_id, message_type, payload, correlation_id, metadata,
                 status, retry_count, max_retries, last_error, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.message_id.get() as i64)
        .bind(&record.message_type)
        .bind(&record.payload)
        .bind(record.correlation_id.map(|c| c.0 as i64))
        .bind(&record.metadata)
        .bind(OutboxStatus::Pending.as_str())
        .bind(0i64)
        .bind(record.max_retries as i64)
        .bind(&record.last_error)
        .bind(record.created_at.timestamp_millis())
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM catga_outbox
            WHERE status = ? AND retry_count < max_retries
            ORDER BY created_at_ms ASC, message_id ASC
            LIMIT ?
            "#,
        )
        .bind(OutboxStatus::Pending.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::parse_row).collect())
    }

    async fn mark_published(&self, message_id: MessageId) -> Result<()> {
        sqlx::query(
            "UPDATE catga_outbox SET status = ?, updated_at_ms = ? WHERE message_id = ?",
        )
        .bind(OutboxStatus::Published.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(message_id.get() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, message_id: MessageId, error: String) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE catga_outbox
            SET retry_count = retry_count + 1,
                last_error = ?,
                updated_at_ms = ?,
                status = CASE WHEN retry_count + 1 >= max_retries THEN ? ELSE status END
            WHERE message_id = ? AND status = ?
            "#,
        )
        .bind(&error)
        .bind(Utc::now().timestamp_millis())
        .bind(OutboxStatus::Failed.as_str())
        .bind(message_id.get() as i64)
        .bind(OutboxStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_published(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let result = sqlx::query(
            "DELETE FROM catga_outbox WHERE status = ? AND updated_at_ms < ?",
        )
        .bind(OutboxStatus::Published.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
