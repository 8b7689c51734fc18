//! Domain error taxonomy shared by every layer above the backend.

/// Errors surfaced by the record service and repository.
///
/// Backend-specific failures never appear here directly: the repository
/// logs them and collapses them into [`KvError::Database`]. Pool exhaustion
/// and pool closure stay distinct so callers can tell "overloaded" from
/// "unreachable".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },
    #[error("key not found")]
    KeyNotFound,
    #[error("key already exists")]
    KeyAlreadyExists,
    #[error("record is not deleted")]
    NotDeleted,
    #[error("database error")]
    Database,
    #[error("timed out waiting for a backend connection")]
    PoolTimeout,
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("rate limit exceeded")]
    RateLimited,
}

impl KvError {
    /// Stable machine-readable code, used in HTTP error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::InvalidValue { .. } => "invalid_value",
            Self::KeyNotFound => "key_not_found",
            Self::KeyAlreadyExists => "key_already_exists",
            Self::NotDeleted => "not_deleted",
            Self::Database => "database_error",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Result alias for domain operations.
pub type KvResult<T> = Result<T, KvError>;
