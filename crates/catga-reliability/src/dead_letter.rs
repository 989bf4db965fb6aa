//! Bounded ring of permanently failed messages, kept for operator
//! inspection after the outbox (or any other retry-tracking caller) has
//! given up on a message.

use std::collections::VecDeque;

use catga_common::MessageId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub exception_type: String,
    pub exception_message: String,
}

impl DeadLetterRecord {
    pub fn new(
        message_id: MessageId,
        message_type: impl Into<String>,
        payload: Vec<u8>,
        retry_count: u32,
        exception_type: impl Into<String>,
        exception_message: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            payload,
            failed_at: Utc::now(),
            retry_count,
            exception_type: exception_type.into(),
            exception_message: exception_message.into(),
        }
    }
}

/// Default capacity, matching the order of magnitude of `fc-router`'s
/// warning-ring default before it starts evicting.
pub const DEFAULT_CAPACITY: usize = 1000;

/// `get_failed` returns entries newest-first: the ring's own push order is
/// oldest-to-newest, so the snapshot is reversed on read. Fixed and
/// documented per the requirement that the ordering be stable.
pub struct DeadLetterQueue {
    records: RwLock<VecDeque<DeadLetterRecord>>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Appends a record, evicting the oldest entry first if already at
    /// capacity.
    pub fn send(&self, record: DeadLetterRecord) {
        let mut records = self.records.write();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        tracing::warn!(
            message_id = record.message_id.get(),
            message_type = %record.message_type,
            retry_count = record.retry_count,
            exception_type = %record.exception_type,
            "message moved to dead letter queue"
        );
        records.push_back(record);
    }

    /// Newest-first snapshot of up to `max_count` entries.
    pub fn get_failed(&self, max_count: usize) -> Vec<DeadLetterRecord> {
        self.records
            .read()
            .iter()
            .rev()
            .take(max_count)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> DeadLetterRecord {
        DeadLetterRecord::new(MessageId::new(id), "Evt", vec![], 3, "Timeout", "boom")
    }

    #[test]
    fn get_failed_returns_newest_first() {
        let dlq = DeadLetterQueue::new();
        dlq.send(record(1));
        dlq.send(record(2));
        dlq.send(record(3));

        let failed = dlq.get_failed(10);
        let ids: Vec<u64> = failed.iter().map(|r| r.message_id.get()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn overflow_evicts_the_oldest_entry() {
        let dlq = DeadLetterQueue::with_capacity(2);
        dlq.send(record(1));
        dlq.send(record(2));
        dlq.send(record(3));

        assert_eq!(dlq.len(), 2);
        let ids: Vec<u64> = dlq.get_failed(10).iter().map(|r| r.message_id.get()).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn get_failed_respects_max_count() {
        let dlq = DeadLetterQueue::new();
        for i in 0..10 {
            dlq.send(record(i));
        }
        assert_eq!(dlq.get_failed(3).len(), 3);
    }

    #[test]
    fn concurrent_sends_land_exactly_once_each() {
        use std::sync::Arc;
        use std::thread;

        let dlq = Arc::new(DeadLetterQueue::with_capacity(10_000));
        let mut handles = Vec::new();
        for t in 0..8 {
            let dlq = dlq.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    dlq.send(record(t * 1000 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(dlq.len(), 1600);
    }
}
