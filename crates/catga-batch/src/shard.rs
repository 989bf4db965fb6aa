//! Per-key queue backing one `AutoBatcher` shard.

use std::sync::atomic::{AtomicBool, AtomicUsize};

use crossbeam_queue::SegQueue;
use tokio::sync::oneshot;

use catga_common::{CatgaResult, Request};

pub(crate) struct BatchEntry<Req: Request> {
    pub request: Req,
    pub completer: oneshot::Sender<CatgaResult<Req::Reply>>,
}

/// Owns a lock-free FIFO of queued entries plus the bookkeeping needed to
/// elect a single flusher and bound queue growth. One `Shard` exists per
/// distinct `BatchKey` a request type's instances resolve to.
pub(crate) struct Shard<Req: Request> {
    pub queue: SegQueue<BatchEntry<Req>>,
    pub count: AtomicUsize,
    pub flush_in_progress: AtomicBool,
    /// CAS-guarded so only the first enqueue after an idle period spawns a
    /// flush timer for this shard.
    pub timer_armed: AtomicBool,
}

impl<Req: Request> Default for Shard<Req> {
    fn default() -> Self {
        Self {
            queue: SegQueue::new(),
            count: AtomicUsize::new(0),
            flush_in_progress: AtomicBool::new(false),
            timer_armed: AtomicBool::new(false),
        }
    }
}
