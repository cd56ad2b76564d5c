use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown storage shard: {0}")]
    UnknownShard(String),

    #[error("clock not ready: {0}")]
    ClockNotReady(String),

    #[error("lock poisoned")]
    LockPoisoned,

    /// A commit hook refused the transaction. The source carries the hook's own error.
    #[error("transaction rejected: {0}")]
    Rejected(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("core error: {0}")]
    Core(#[from] trinity_core::CoreError),
}

impl StorageError {
    pub fn rejected(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StorageError::Rejected(Box::new(err))
    }
}
