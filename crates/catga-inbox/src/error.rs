use thiserror::Error;

#[derive(Debug, Error)]
pub enum InboxError {
    #[cfg(feature = "sqlite")]
    #[error("sqlite backend error: {0}")]
    Sqlite(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, InboxError>;
