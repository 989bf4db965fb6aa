//! `InboxStore` contract (spec §4.8) and its in-memory reference backend.

use std::time::Duration;

use async_trait::async_trait;
use catga_common::MessageId;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Result;
use crate::model::{InboxRecord, InboxStatus};

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Atomically acquires a processing lease. Succeeds iff there is no
    /// `Processed` record and either no lease exists or the existing
    /// lease's expiry has passed. Must be expressed as a single atomic
    /// operation on any shared backend — a "check, then set" sequence
    /// admits two callers both observing no lease and both proceeding.
    async fn try_lock(&self, message_id: MessageId, lease_duration: Duration) -> Result<bool>;

    /// Idempotent: stores the result and marks the record `Processed`.
    async fn mark_processed(&self, record: InboxRecord) -> Result<()>;

    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool>;

    /// `None` for a message that is locked but not yet processed, as well
    /// as for one never seen.
    async fn get_processed_result(&self, message_id: MessageId) -> Result<Option<Vec<u8>>>;

    /// Clears the lease without marking processed. No-op if no lease
    /// exists.
    async fn release_lock(&self, message_id: MessageId) -> Result<()>;

    async fn delete_processed(&self, older_than: Duration) -> Result<u64>;
}

#[derive(Clone)]
struct InboxSlot {
    status: InboxStatus,
    lock_expires_at: Option<chrono::DateTime<Utc>>,
    processing_result: Option<Vec<u8>>,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryInboxStore {
    records: DashMap<u64, InboxSlot>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn try_lock(&self, message_id: MessageId, lease_duration: Duration) -> Result<bool> {
        let now = Utc::now();
        let lease_expiry = now + chrono::Duration::from_std(lease_duration).unwrap_or(chrono::Duration::zero());

        // DashMap's entry API locks the owning shard for the duration of
        // this match, making the read-then-write below a single atomic
        // step rather than two separately-lockable operations.
        let acquired = match self.records.entry(message_id.get()) {
            Entry::Vacant(slot) => {
                slot.insert(InboxSlot {
                    status: InboxStatus::Processing,
                    lock_expires_at: Some(lease_expiry),
                    processing_result: None,
                    created_at: now,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                let reclaimable = existing.status == InboxStatus::Processing
                    && existing.lock_expires_at.map(|exp| exp < now).unwrap_or(false);
                if existing.status == InboxStatus::Processed {
                    false
                } else if reclaimable {
                    let created_at = existing.created_at;
                    tracing::warn!(message_id = message_id.get(), "reclaiming expired inbox lease");
                    slot.insert(InboxSlot {
                        status: InboxStatus::Processing,
                        lock_expires_at: Some(lease_expiry),
                        processing_result: None,
                        created_at,
                    });
                    true
                } else {
                    false
                }
            }
        };
        Ok(acquired)
    }

    async fn mark_processed(&self, record: InboxRecord) -> Result<()> {
        let now = Utc::now();
        self.records
            .entry(record.message_id.get())
            .and_modify(|e| {
                e.status = InboxStatus::Processed;
                e.lock_expires_at = None;
                e.processing_result = record.processing_result.clone();
            })
            .or_insert(InboxSlot {
                status: InboxStatus::Processed,
                lock_expires_at: None,
                processing_result: record.processing_result,
                created_at: now,
            });
        Ok(())
    }

    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool> {
        Ok(self
            .records
            .get(&message_id.get())
            .map(|e| e.status == InboxStatus::Processed)
            .unwrap_or(false))
    }

    async fn get_processed_result(&self, message_id: MessageId) -> Result<Option<Vec<u8>>> {
        Ok(self.records.get(&message_id.get()).and_then(|e| {
            if e.status == InboxStatus::Processed {
                e.processing_result.clone()
            } else {
                None
            }
        }))
    }

    async fn release_lock(&self, message_id: MessageId) -> Result<()> {
        let should_remove = self
            .records
            .get(&message_id.get())
            .map(|e| e.status == InboxStatus::Processing)
            .unwrap_or(false);
        if should_remove {
            self.records.remove(&message_id.get());
        }
        Ok(())
    }

    async fn delete_processed(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let to_remove: Vec<u64> = self
            .records
            .iter()
            .filter(|e| e.status == InboxStatus::Processed && e.created_at < cutoff)
            .map(|e| *e.key())
            .collect();
        for key in &to_remove {
            self.records.remove(key);
        }
        Ok(to_remove.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_try_lock_admits_exactly_one_winner() {
        let store = Arc::new(InMemoryInboxStore::new());
        let successes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            let successes = successes.clone();
            handles.push(tokio::spawn(async move {
                if store.try_lock(MessageId::new(42), Duration::from_secs(60)).await.unwrap() {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn processed_record_is_never_relockable() {
        let store = InMemoryInboxStore::new();
        assert!(store.try_lock(MessageId::new(1), Duration::from_secs(1)).await.unwrap());
        store
            .mark_processed(InboxRecord::processed(MessageId::new(1), "Evt", vec![9]))
            .await
            .unwrap();
        assert!(!store.try_lock(MessageId::new(1), Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let store = InMemoryInboxStore::new();
        assert!(store
            .try_lock(MessageId::new(1), Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.try_lock(MessageId::new(1), Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn get_processed_result_is_none_while_only_locked() {
        let store = InMemoryInboxStore::new();
        store.try_lock(MessageId::new(1), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get_processed_result(MessageId::new(1)).await.unwrap(), None);
    }
}
