//! Ledger error types.

use thiserror::Error;

/// Errors raised by the memory ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Content failed subtype schema or temporal validation.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Optimistic concurrency check failed on supersede; the record was
    /// already superseded by a concurrent writer.
    #[error("memory {0} already superseded (concurrent update)")]
    AlreadySuperseded(String),

    /// The referenced memory does not exist.
    #[error("memory not found: {0}")]
    NotFound(String),

    /// The underlying SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored JSON column could not be decoded.
    #[error("corrupt stored content: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Filesystem failure (backup files, directories).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backup verification failed.
    #[error("backup verification failed: {}", .0.join("; "))]
    BackupVerification(Vec<String>),

    /// Internal invariant breakage.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
