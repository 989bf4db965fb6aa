//! SQLite-backed `InboxStore`. The atomic lease acquisition spec requires is
//! expressed as a single `INSERT ... ON CONFLICT DO UPDATE ... WHERE`
//! upsert — SQLite only applies the `DO UPDATE` when its `WHERE` clause
//! holds, so a concurrent loser's statement affects zero rows instead of
//! racing a separate read against a separate write.

use std::time::Duration;

use async_trait::async_trait;
use catga_common::MessageId;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::model::{InboxRecord, InboxStatus};
use crate::store::InboxStore;

pub struct SqliteInboxStore {
    pool: SqlitePool,
}

impl SqliteInboxStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init_schema().await?;
        tracing::debug!("sqlite inbox store ready");
        Ok(store)
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catga_inbox (
                message_id        INTEGER PRIMARY KEY,
                message_type      TEXT NOT NULL,
                status            TEXT NOT NULL,
                lock_expires_ms   INTEGER,
                processing_result BLOB,
                created_at_ms     INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl InboxStore for SqliteInboxStore {
    async fn try_lock(&self, message_id: MessageId, lease_duration: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let lease_expiry = now + lease_duration.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO catga_inbox (message_id, message_type, status, lock_expires_ms, created_at_ms)
            VALUES (?, '', ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                status = excluded.status,
                lock_expires_ms = excluded.lock_expires_ms
            WHERE catga_inbox.status != ? AND (
                catga_inbox.lock_expires_ms IS NULL OR catga_inbox.lock_expires_ms < ?
            )
            "#,
        )
        .bind(message_id.get() as i64)
        .bind(InboxStatus::Processing.as_str())
        .bind(lease_expiry)
        .bind(now)
        .bind(InboxStatus::Processed.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, record: InboxRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO catga_inbox (message_id, message_type, status, lock_expires_ms, processing_result, created_at_ms)
            VALUES (?, ?, ?, NULL, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                status = excluded.status,
                lock_expires_ms = NULL,
                processing_result = excluded.processing_result
            "#,
        )
        .bind(record.message_id.get() as i64)
        .bind(&record.message_type)
        .bind(InboxStatus::Processed.as_str())
        .bind(&record.processing_result)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool> {
        let row = sqlx::query("SELECT status FROM catga_inbox WHERE message_id = ?")
            .bind(message_id.get() as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<String, _>("status") == InboxStatus::Processed.as_str())
            .unwrap_or(false))
    }

    async fn get_processed_result(&self, message_id: MessageId) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT status, processing_result FROM catga_inbox WHERE message_id = ?")
            .bind(message_id.get() as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            if r.get::<String, _>("status") == InboxStatus::Processed.as_str() {
                r.get::<Option<Vec<u8>>, _>("processing_result")
            } else {
                None
            }
        }))
    }

    async fn release_lock(&self, message_id: MessageId) -> Result<()> {
        sqlx::query("DELETE FROM catga_inbox WHERE message_id = ? AND status = ?")
            .bind(message_id.get() as i64)
            .bind(InboxStatus::Processing.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_processed(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let result = sqlx::query("DELETE FROM catga_inbox WHERE status = ? AND created_at_ms < ?")
            .bind(InboxStatus::Processed.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
