//! `OutboxStore` contract (spec §4.7) and its in-memory reference backend.

use std::time::Duration;

use async_trait::async_trait;
use catga_common::MessageId;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{OutboxError, Result};
use crate::model::{OutboxRecord, OutboxStatus};

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persists with `Status = Pending`. Rejects `message_id == 0`.
    async fn add(&self, record: OutboxRecord) -> Result<()>;

    /// Records with `Status = Pending` and `retry_count < max_retries`,
    /// ordered by `created_at` ascending (ties broken by `message_id`),
    /// bounded by `limit`.
    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Transitions to `Published`. Idempotent.
    async fn mark_published(&self, message_id: MessageId) -> Result<()>;

    /// Increments `retry_count`; moves to `Failed` once it reaches
    /// `max_retries`, otherwise stays `Pending` with `last_error` updated.
    /// Idempotent once the record is already terminal.
    async fn mark_failed(&self, message_id: MessageId, error: String) -> Result<()>;

    /// Prunes `Published` records whose `updated_at` is older than
    /// `older_than`. Returns the number of records removed.
    async fn delete_published(&self, older_than: Duration) -> Result<u64>;
}

#[derive(Default)]
pub struct InMemoryOutboxStore {
    records: RwLock<IndexMap<u64, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add(&self, record: OutboxRecord) -> Result<()> {
        if record.message_id.get() == 0 {
            return Err(OutboxError::ZeroMessageId);
        }
        self.records.write().insert(record.message_id.get(), record);
        Ok(())
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let records = self.records.read();
        let mut pending: Vec<OutboxRecord> = records
            .values()
            .filter(|r| r.status == OutboxStatus::Pending && r.retry_count < r.max_retries)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.get().cmp(&b.message_id.get()))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, message_id: MessageId) -> Result<()> {
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(&message_id.get()) {
            record.status = OutboxStatus::Published;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(&self, message_id: MessageId, error: String) -> Result<()> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(&message_id.get()) else {
            return Ok(());
        };
        if record.status != OutboxStatus::Pending {
            return Ok(());
        }
        record.retry_count += 1;
        record.last_error = Some(error);
        record.updated_at = Utc::now();
        if record.retry_count >= record.max_retries {
            record.status = OutboxStatus::Failed;
            tracing::warn!(
                message_id = message_id.get(),
                retry_count = record.retry_count,
                "outbox record exhausted retries, moving to failed"
            );
        }
        Ok(())
    }

    async fn delete_published(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut records = self.records.write();
        let to_remove: Vec<u64> = records
            .values()
            .filter(|r| r.status == OutboxStatus::Published && r.updated_at < cutoff)
            .map(|r| r.message_id.get())
            .collect();
        for key in &to_remove {
            records.shift_remove(key);
        }
        Ok(to_remove.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, max_retries: u32) -> OutboxRecord {
        OutboxRecord::new(MessageId::new(id), "TestEvent", vec![1, 2, 3], max_retries)
    }

    #[tokio::test]
    async fn add_rejects_zero_message_id() {
        let store = InMemoryOutboxStore::new();
        let result = store.add(record(0, 3)).await;
        assert!(matches!(result, Err(OutboxError::ZeroMessageId)));
    }

    #[tokio::test]
    async fn get_pending_excludes_published_and_failed() {
        let store = InMemoryOutboxStore::new();
        store.add(record(1, 3)).await.unwrap();
        store.add(record(2, 3)).await.unwrap();
        store.mark_published(MessageId::new(1)).await.unwrap();

        let pending = store.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id.get(), 2);
    }

    #[tokio::test]
    async fn mark_failed_exhausts_retries_into_failed_state() {
        let store = InMemoryOutboxStore::new();
        for id in 1..=100u64 {
            store.add(record(id, 2)).await.unwrap();
        }
        for id in 1..=100u64 {
            for _ in 0..3 {
                store.mark_failed(MessageId::new(id), "boom".to_string()).await.unwrap();
            }
        }

        assert_eq!(store.get_pending(1000).await.unwrap().len(), 0);
        let records = store.records.read();
        assert!(records.values().all(|r| r.status == OutboxStatus::Failed));
    }

    #[tokio::test]
    async fn mark_published_is_idempotent() {
        let store = InMemoryOutboxStore::new();
        store.add(record(1, 3)).await.unwrap();
        store.mark_published(MessageId::new(1)).await.unwrap();
        store.mark_published(MessageId::new(1)).await.unwrap();
        let records = store.records.read();
        assert_eq!(records.get(&1).unwrap().status, OutboxStatus::Published);
    }
}
