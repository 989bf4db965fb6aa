//! Exactly-once processing ledger: lease-based dedup of inbound messages.

mod error;
mod model;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;

pub use error::{InboxError, Result};
pub use model::{InboxRecord, InboxStatus};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteInboxStore;
pub use store::{InMemoryInboxStore, InboxStore};
