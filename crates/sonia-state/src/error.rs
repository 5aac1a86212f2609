//! State store error types.

use thiserror::Error;

/// Errors raised by the durable state store.
///
/// Most callers never see these: write paths swallow them after logging.
#[derive(Debug, Error)]
pub enum StateError {
    /// The underlying SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored JSON column could not be decoded.
    #[error("corrupt stored payload: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// The store's worker thread was lost.
    #[error("state store worker failed: {0}")]
    Worker(String),
}

/// Result type for state store operations.
pub type StateResult<T> = Result<T, StateError>;
