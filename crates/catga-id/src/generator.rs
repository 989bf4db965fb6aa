//! Lock-free Snowflake id generation.
//!
//! The hot path is a single `compare_exchange_weak` loop against one packed
//! `AtomicU64` word holding `(timestamp, sequence)`. The worker id never
//! enters the CAS word — it's constant for the generator's lifetime and is
//! spliced in only when assembling the final id — so contention is limited
//! to the minimum state that actually needs to change per call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::warn;

use crate::layout::SnowflakeLayout;
pub use crate::layout::ParsedId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("system clock moved backwards by {millis}ms")]
    ClockBackwards { millis: u64 },
    #[error(transparent)]
    Layout(#[from] crate::layout::LayoutError),
}

/// Configuration for an [`IdGenerator`].
#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub layout: SnowflakeLayout,
    pub worker_id: u64,
    /// Epoch the timestamp component is measured from, in Unix milliseconds.
    pub epoch_ms: u64,
    /// When true, `next_id` panics on clock regression instead of retrying
    /// for a few milliseconds and then panicking. Off by default — a host
    /// that wants hard-panic semantics opts in explicitly.
    pub panic_on_clock_backwards: bool,
}

impl GeneratorConfig {
    pub fn new(worker_id: u64) -> Self {
        Self {
            layout: SnowflakeLayout::default(),
            worker_id,
            epoch_ms: 1_700_000_000_000,
            panic_on_clock_backwards: false,
        }
    }
}

/// Packed `(timestamp << sequence_bits) | sequence` state word, padded to a
/// full cache line so contending generators on other cores never evict this
/// one's line via false sharing.
#[repr(align(64))]
struct PaddedState {
    word: AtomicU64,
}

/// Maximum number of milliseconds `next_id` will spin waiting for the clock
/// to catch up to the last observed timestamp before giving up.
const CLOCK_WAIT_RETRY_MS: u64 = 5;

pub struct IdGenerator {
    layout: SnowflakeLayout,
    worker_id: u64,
    epoch_ms: u64,
    panic_on_clock_backwards: bool,
    state: PaddedState,
}

impl IdGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, IdError> {
        config.layout.validate_worker_id(config.worker_id)?;
        Ok(Self {
            layout: config.layout,
            worker_id: config.worker_id,
            epoch_ms: config.epoch_ms,
            panic_on_clock_backwards: config.panic_on_clock_backwards,
            state: PaddedState {
                word: AtomicU64::new(0),
            },
        })
    }

    /// Single-node development constructor. Picks a worker id from the
    /// low bits of the process start time rather than requiring explicit
    /// coordination, and logs a warning since a real deployment must assign
    /// worker ids deliberately to avoid collisions across processes.
    pub fn dev_single_node() -> Self {
        let layout = SnowflakeLayout::default();
        let worker_id = (current_millis() & layout.worker_mask() as u128) as u64;
        warn!(
            worker_id,
            "catga-id: using an implicit worker id from process start time; \
             only safe for single-node development"
        );
        Self::new(GeneratorConfig {
            layout,
            worker_id,
            epoch_ms: 1_700_000_000_000,
            panic_on_clock_backwards: false,
        })
        .expect("derived worker id always fits the default layout")
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn layout(&self) -> SnowflakeLayout {
        self.layout
    }

    fn elapsed_ms(&self) -> u64 {
        current_millis().saturating_sub(self.epoch_ms as u128) as u64
    }

    /// Decompose a previously generated id.
    pub fn parse(&self, id: u64) -> ParsedId {
        self.layout.disassemble(id)
    }

    /// Generate the next id, retrying through sequence exhaustion and brief
    /// clock regression. With `panic_on_clock_backwards` set, panics as soon
    /// as a backward step is observed; otherwise spins for up to
    /// `CLOCK_WAIT_RETRY_MS` waiting for the clock to catch up before
    /// panicking, so a persistent backward step (a bad NTP correction, say)
    /// can't spin a core forever.
    pub fn next_id(&self) -> u64 {
        let deadline = Instant::now() + Duration::from_millis(CLOCK_WAIT_RETRY_MS);
        loop {
            match self.try_next_id() {
                Ok(id) => return id,
                Err(IdError::ClockBackwards { millis }) => {
                    if self.panic_on_clock_backwards || Instant::now() >= deadline {
                        panic!("catga-id: clock moved backwards by {millis}ms");
                    }
                    std::thread::yield_now();
                }
                Err(other) => unreachable!("next_id: unexpected error {other:?}"),
            }
        }
    }

    /// Generate the next id without ever panicking. Fails cleanly, without
    /// mutating generator state, if the system clock is behind the last
    /// observed timestamp.
    pub fn try_next_id(&self) -> Result<u64, IdError> {
        let seq_mask = self.layout.sequence_mask();
        loop {
            let prev = self.state.word.load(Ordering::Acquire);
            let last_ts = prev >> self.layout.sequence_bits;
            let now = self.elapsed_ms();

            let next_word = if now > last_ts {
                now << self.layout.sequence_bits
            } else if now == last_ts {
                let seq = prev & seq_mask;
                if seq < seq_mask {
                    prev + 1
                } else {
                    // Sequence exhausted for this millisecond; spin to the
                    // next tick rather than failing the caller.
                    std::thread::yield_now();
                    continue;
                }
            } else {
                let millis = last_ts - now;
                return Err(IdError::ClockBackwards { millis });
            };

            if self
                .state
                .word
                .compare_exchange_weak(prev, next_word, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let timestamp = next_word >> self.layout.sequence_bits;
                let sequence = next_word & seq_mask;
                return Ok(self.layout.assemble(timestamp, self.worker_id, sequence));
            }
        }
    }

    /// Fill `dest` with freshly generated ids, returning how many were
    /// written. Attempts a single CAS reserving a contiguous sequence range
    /// when the whole batch fits within one millisecond's sequence space;
    /// otherwise falls back to generating one id at a time. On clock
    /// regression mid-batch the whole call fails (returns 0) rather than
    /// handing back a partial, ambiguous prefix.
    pub fn next_ids(&self, dest: &mut [u64]) -> Result<usize, IdError> {
        if dest.is_empty() {
            return Ok(0);
        }

        let seq_mask = self.layout.sequence_mask();
        if (dest.len() as u64) <= seq_mask + 1 {
            if let Some(written) = self.try_reserve_contiguous(dest)? {
                return Ok(written);
            }
        }

        for (i, slot) in dest.iter_mut().enumerate() {
            match self.try_next_id() {
                Ok(id) => *slot = id,
                Err(e @ IdError::ClockBackwards { .. }) => {
                    if i == 0 {
                        return Err(e);
                    }
                    // Partial progress already made by the contiguous path
                    // never happens here (that path is all-or-nothing), so a
                    // mid-loop failure still means no fast, contiguous
                    // reservation exists; surface it rather than returning
                    // an ambiguous partial count.
                    return Err(e);
                }
                Err(other) => return Err(other),
            }
        }
        Ok(dest.len())
    }

    /// Try to reserve `dest.len()` contiguous sequence numbers within the
    /// current (or next) millisecond in one CAS. Returns `Ok(None)` when the
    /// current sequence window doesn't have enough room and the caller
    /// should fall back to per-id generation.
    fn try_reserve_contiguous(&self, dest: &mut [u64]) -> Result<Option<usize>, IdError> {
        let seq_mask = self.layout.sequence_mask();
        let count = dest.len() as u64;

        loop {
            let prev = self.state.word.load(Ordering::Acquire);
            let last_ts = prev >> self.layout.sequence_bits;
            let now = self.elapsed_ms();

            let (timestamp, start_seq) = if now > last_ts {
                (now, 0)
            } else if now == last_ts {
                let seq = prev & seq_mask;
                (now, seq + 1)
            } else {
                let millis = last_ts - now;
                return Err(IdError::ClockBackwards { millis });
            };

            let end_seq = start_seq + count - 1;
            if end_seq > seq_mask {
                return Ok(None);
            }

            let next_word = (timestamp << self.layout.sequence_bits) | end_seq;
            if self
                .state
                .word
                .compare_exchange_weak(prev, next_word, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                for (offset, slot) in dest.iter_mut().enumerate() {
                    *slot = self
                        .layout
                        .assemble(timestamp, self.worker_id, start_seq + offset as u64);
                }
                return Ok(Some(dest.len()));
            }
        }
    }
}

fn current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn generator(worker_id: u64) -> IdGenerator {
        IdGenerator::new(GeneratorConfig::new(worker_id)).unwrap()
    }

    #[test]
    fn ids_are_monotonic_and_distinct_single_threaded() {
        let gen = generator(1);
        let mut prev = 0;
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > prev, "ids must be strictly increasing");
            assert!(seen.insert(id), "id {id} generated twice");
            prev = id;
        }
    }

    #[test]
    fn parse_recovers_configured_worker_id() {
        let gen = generator(42);
        let id = gen.next_id();
        let parsed = gen.parse(id);
        assert_eq!(parsed.worker, 42);
    }

    #[test]
    fn rejects_worker_id_outside_layout_range() {
        let layout = SnowflakeLayout::default();
        let config = GeneratorConfig {
            layout,
            worker_id: layout.worker_mask() + 1,
            epoch_ms: 0,
            panic_on_clock_backwards: false,
        };
        assert!(matches!(
            IdGenerator::new(config),
            Err(IdError::Layout(_))
        ));
    }

    #[test]
    fn try_next_id_fails_without_mutating_state_on_clock_backwards() {
        let gen = generator(3);
        // Prime the state word with a timestamp far in the future so every
        // subsequent call observes `now < last_ts`.
        gen.state.word.store(u64::MAX >> 1, Ordering::Release);

        let before = gen.state.word.load(Ordering::Acquire);
        let result = gen.try_next_id();
        let after = gen.state.word.load(Ordering::Acquire);

        assert!(matches!(result, Err(IdError::ClockBackwards { .. })));
        assert_eq!(before, after, "failed call must not mutate state");
    }

    #[test]
    #[should_panic(expected = "clock moved backwards")]
    fn next_id_panics_after_the_retry_window_on_persistent_clock_backwards() {
        let gen = generator(3);
        gen.state.word.store(u64::MAX >> 1, Ordering::Release);
        gen.next_id();
    }

    #[test]
    fn next_ids_contiguous_batch_round_trips() {
        let gen = generator(5);
        let mut buf = vec![0u64; 64];
        let written = gen.next_ids(&mut buf).unwrap();
        assert_eq!(written, buf.len());

        let mut seen = HashSet::new();
        for &id in &buf {
            assert!(seen.insert(id));
            assert_eq!(gen.parse(id).worker, 5);
        }
    }

    #[test]
    fn concurrent_generation_produces_unique_ids() {
        let gen = Arc::new(generator(9));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = Arc::clone(&gen);
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(move |_| gen.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id {id} across threads");
            }
        }
        assert_eq!(all.len(), 8 * 2_000);
    }
}
