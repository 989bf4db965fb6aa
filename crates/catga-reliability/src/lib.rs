//! Replay protection and a terminal-failure ledger: the two reliability
//! primitives that sit outside the outbox/inbox pipeline proper.

mod dead_letter;
mod idempotency;

pub use dead_letter::{DeadLetterQueue, DeadLetterRecord, DEFAULT_CAPACITY};
pub use idempotency::{CachedOutcome, Fingerprint, IdempotencyStore, DEFAULT_RETENTION};
