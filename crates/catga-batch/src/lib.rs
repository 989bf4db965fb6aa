//! Per-key sharded auto-batching for request types that opt in via
//! `AutoBatched`.

mod batcher;
mod shard;

pub use batcher::AutoBatcher;
