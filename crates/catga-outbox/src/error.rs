use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("message id must be non-zero")]
    ZeroMessageId,
    #[error("no outbox record found for message {0}")]
    NotFound(u64),
    #[cfg(feature = "sqlite")]
    #[error("sqlite backend error: {0}")]
    Sqlite(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, OutboxError>;
