//! Supervisor error types.

use thiserror::Error;

/// Errors raised by the service supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The named service is not in the supervision table.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The service has no restart command configured.
    #[error("no restart command for {0}")]
    NoRestartCommand(String),

    /// The restart budget for the window is exhausted.
    #[error("restart policy exhausted for {service}: {count} in {window_s}s")]
    RestartExhausted {
        /// The service.
        service: String,
        /// Restarts already performed in the window.
        count: u32,
        /// The window in seconds.
        window_s: f64,
    },

    /// The restart spawn failed.
    #[error("restart spawn failed for {service}: {source}")]
    SpawnFailed {
        /// The service.
        service: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The status HTTP server failed.
    #[error("http server error: {0}")]
    Http(String),
}

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;
