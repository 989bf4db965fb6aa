//! Short-TTL cache mapping a caller-supplied fingerprint to the result of
//! the operation it identifies, so a replayed request returns the original
//! result instead of re-running the handler.

use std::time::Duration;

use catga_common::ErrorInfo;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// A caller-supplied key identifying an idempotent operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The outcome cached against a fingerprint: either the handler's own
/// success payload, or the failure it produced, so a replay observes the
/// exact same `CatgaResult` the original caller did.
#[derive(Clone)]
pub enum CachedOutcome {
    Success(Vec<u8>),
    Failure(ErrorInfo),
}

impl std::fmt::Debug for CachedOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachedOutcome::Success(bytes) => f.debug_tuple("Success").field(&bytes.len()).finish(),
            CachedOutcome::Failure(err) => f.debug_tuple("Failure").field(&err.code).finish(),
        }
    }
}

struct CacheEntry {
    outcome: CachedOutcome,
    expires_at: DateTime<Utc>,
}

/// Default retention applied when a caller does not specify one. A caller
/// that wants record-level control can call `mark_processed_for` directly
/// instead.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Records are kept in a plain `DashMap`, not a CAS-guarded structure: the
/// pipeline composition recommended elsewhere (idempotency wraps outermost)
/// already guarantees a single writer per fingerprint at any moment, so a
/// non-atomic insert-then-read is sufficient here.
pub struct IdempotencyStore {
    entries: DashMap<Fingerprint, CacheEntry>,
    default_retention: Duration,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::with_default_retention(DEFAULT_RETENTION)
    }

    pub fn with_default_retention(default_retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_retention,
        }
    }

    pub fn has_been_processed(&self, fingerprint: &Fingerprint) -> bool {
        match self.entries.get(fingerprint) {
            Some(entry) if entry.expires_at > Utc::now() => true,
            Some(_) => false,
            None => false,
        }
    }

    /// Caches `outcome` against `fingerprint` using the store's default
    /// retention.
    pub fn mark_processed(&self, fingerprint: Fingerprint, outcome: CachedOutcome) {
        self.mark_processed_for(fingerprint, outcome, self.default_retention);
    }

    pub fn mark_processed_for(&self, fingerprint: Fingerprint, outcome: CachedOutcome, retention: Duration) {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        self.entries.insert(fingerprint, CacheEntry { outcome, expires_at });
    }

    /// Returns the cached outcome if present and not expired. An expired
    /// entry reads as absent but is left in place for `sweep_expired` to
    /// reclaim, avoiding a write on every read-path lookup.
    pub fn get_cached_result(&self, fingerprint: &Fingerprint) -> Option<CachedOutcome> {
        self.entries.get(fingerprint).and_then(|entry| {
            if entry.expires_at > Utc::now() {
                Some(entry.outcome.clone())
            } else {
                None
            }
        })
    }

    /// Evicts all expired entries and returns how many were removed. Hosts
    /// call this on a timer; nothing in the store schedules it itself.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.entries.remove(&key);
        }
        if count > 0 {
            tracing::debug!(count, "swept expired idempotency records");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catga_common::ErrorCode;

    #[test]
    fn unprocessed_fingerprint_reads_as_absent() {
        let store = IdempotencyStore::new();
        assert!(!store.has_been_processed(&Fingerprint::new("op-1")));
        assert!(store.get_cached_result(&Fingerprint::new("op-1")).is_none());
    }

    #[test]
    fn cached_result_survives_until_expiry() {
        let store = IdempotencyStore::new();
        let fp = Fingerprint::new("op-1");
        store.mark_processed(fp.clone(), CachedOutcome::Success(vec![1, 2, 3]));

        assert!(store.has_been_processed(&fp));
        match store.get_cached_result(&fp) {
            Some(CachedOutcome::Success(bytes)) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("expected cached success, got {other:?}"),
        }
    }

    #[test]
    fn failure_outcomes_round_trip_too() {
        let store = IdempotencyStore::new();
        let fp = Fingerprint::new("op-2");
        store.mark_processed(
            fp.clone(),
            CachedOutcome::Failure(ErrorInfo::new(ErrorCode::ValidationFailed, "bad input")),
        );

        match store.get_cached_result(&fp) {
            Some(CachedOutcome::Failure(err)) => assert_eq!(err.code, ErrorCode::ValidationFailed),
            other => panic!("expected cached failure, got {other:?}"),
        }
    }

    #[test]
    fn expired_entry_is_treated_as_unprocessed() {
        let store = IdempotencyStore::with_default_retention(Duration::from_millis(1));
        let fp = Fingerprint::new("op-3");
        store.mark_processed(fp.clone(), CachedOutcome::Success(vec![]));
        std::thread::sleep(Duration::from_millis(20));

        assert!(!store.has_been_processed(&fp));
        assert!(store.get_cached_result(&fp).is_none());
    }

    #[test]
    fn sweep_expired_reclaims_only_stale_entries() {
        let store = IdempotencyStore::new();
        store.mark_processed_for(
            Fingerprint::new("stale"),
            CachedOutcome::Success(vec![]),
            Duration::from_millis(1),
        );
        store.mark_processed(Fingerprint::new("fresh"), CachedOutcome::Success(vec![]));
        std::thread::sleep(Duration::from_millis(20));

        let removed = store.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }
}
