//! Durable, status-indexed outbox of messages pending publication.

mod error;
mod model;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;

pub use error::{OutboxError, Result};
pub use model::{OutboxRecord, OutboxStatus};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxStore;
pub use store::{InMemoryOutboxStore, OutboxStore};
