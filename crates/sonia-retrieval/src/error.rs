//! Retrieval error types.

use thiserror::Error;

/// Errors raised by the retrieval subsystem.
///
/// The hybrid layer mostly logs these instead of propagating; the typed
/// form exists for the init paths that callers do observe.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The embeddings service call failed.
    #[error("embeddings request failed: {0}")]
    Embeddings(String),

    /// The embeddings service returned an unusable shape.
    #[error("embeddings response invalid: {0}")]
    EmbeddingsShape(String),

    /// Vector index persistence failed.
    #[error("index io error: {0}")]
    IndexIo(#[from] std::io::Error),

    /// Persisted index data could not be decoded.
    #[error("index data corrupt: {0}")]
    IndexCorrupt(#[from] serde_json::Error),

    /// A vector had the wrong dimension for the index.
    #[error("dimension mismatch: index is {expected}, got {got}")]
    DimensionMismatch {
        /// The index dimension.
        expected: usize,
        /// The offered vector's dimension.
        got: usize,
    },

    /// The ledger scan behind a preload failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] sonia_ledger::LedgerError),
}

/// Result type for retrieval operations.
pub type RetrievalResult<T> = Result<T, RetrievalError>;
