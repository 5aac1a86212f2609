//! Shared error taxonomy for the Sonia core runtime.
//!
//! Pipeline stages never raise across an HTTP boundary; they translate
//! into `{ok: false, error: {code, message}}` envelopes built from these
//! kinds. Best-effort persistence paths swallow their errors after
//! logging; safety failures (policy denial, sandbox escape) never do.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in Sonia core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad request shape, failed schema, bad temporal bounds. Never retried.
    #[error("validation failed: {}", messages.join("; "))]
    Validation {
        /// The specific validation messages.
        messages: Vec<String>,
    },

    /// Policy engine returned DENY or a sandbox boundary was violated.
    #[error("policy denied: {reason}")]
    PolicyDenied {
        /// Why the action was refused.
        reason: String,
    },

    /// Optimistic CAS failure on supersede or confirmation decide.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A stage exceeded its time budget.
    #[error("timeout after {timeout_ms}ms in {stage}")]
    Timeout {
        /// The stage that timed out.
        stage: String,
        /// The budget that was exceeded.
        timeout_ms: u64,
    },

    /// Network/IO hiccup, empty output, noisy subprocess. Retried once at
    /// the boundary.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Failure confirmed after retry.
    #[error("deterministic failure: {0}")]
    Deterministic(String),

    /// Request dropped because the per-session queue was full.
    #[error("backpressure shed for session {session_id}")]
    BackpressureShed {
        /// The session whose queue was full.
        session_id: String,
    },

    /// Missing resource or gate script.
    #[error("not found: {0}")]
    NotFound(String),

    /// Downstream marked open by its circuit breaker.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// Storage backend failure on a path that must not be swallowed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Internal invariant breakage.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Build a validation error from a single message.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            messages: vec![message.into()],
        }
    }

    /// Short machine-readable error code for wire envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_failed",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Timeout { .. } => "timeout",
            Self::Transient(_) => "transient_failure",
            Self::Deterministic(_) => "deterministic_failure",
            Self::BackpressureShed { .. } => "backpressure_shed",
            Self::NotFound(_) => "not_found",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether a retry at the boundary could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout { .. } | Self::Storage(_)
        )
    }

    /// The DLQ failure class for a dead-lettered action that failed with
    /// this error.
    #[must_use]
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Validation { .. } => FailureClass::ValidationFailed,
            Self::PolicyDenied { .. } => FailureClass::PolicyDenied,
            Self::CircuitOpen(_) => FailureClass::CircuitOpen,
            Self::Timeout { .. } => FailureClass::Timeout,
            Self::Transient(_) | Self::Storage(_) => FailureClass::Transient,
            _ => FailureClass::ExecutionError,
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure classification carried on dead letters and replay traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Generic executor failure.
    ExecutionError,
    /// Stage exceeded its budget.
    Timeout,
    /// Downstream breaker was open. Non-retryable in the DLQ.
    CircuitOpen,
    /// Policy engine refused the action. Non-retryable in the DLQ.
    PolicyDenied,
    /// Request or schema validation failed. Non-retryable in the DLQ.
    ValidationFailed,
    /// Network/IO hiccup believed transient.
    Transient,
}

impl FailureClass {
    /// Stable wire string for this class.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionError => "execution_error",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::PolicyDenied => "policy_denied",
            Self::ValidationFailed => "validation_failed",
            Self::Transient => "transient",
        }
    }

    /// Parse a wire string; unknown strings map to `ExecutionError`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "timeout" => Self::Timeout,
            "circuit_open" => Self::CircuitOpen,
            "policy_denied" => Self::PolicyDenied,
            "validation_failed" => Self::ValidationFailed,
            "transient" => Self::Transient,
            _ => Self::ExecutionError,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::Validation {
            messages: vec!["bad subtype".to_string(), "bad bound".to_string()],
        };
        assert_eq!(err.to_string(), "validation failed: bad subtype; bad bound");

        let err = CoreError::Timeout {
            stage: "model".to_string(),
            timeout_ms: 60_000,
        };
        assert_eq!(err.to_string(), "timeout after 60000ms in model");
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            CoreError::PolicyDenied {
                reason: "x".into()
            }
            .code(),
            "policy_denied"
        );
        assert_eq!(
            CoreError::BackpressureShed {
                session_id: "ses_1".into()
            }
            .code(),
            "backpressure_shed"
        );
    }

    #[test]
    fn test_retryability() {
        assert!(CoreError::Transient("blip".into()).is_retryable());
        assert!(!CoreError::validation("nope").is_retryable());
        assert!(!CoreError::PolicyDenied { reason: "no".into() }.is_retryable());
    }

    #[test]
    fn test_failure_class_round_trip() {
        for class in [
            FailureClass::ExecutionError,
            FailureClass::Timeout,
            FailureClass::CircuitOpen,
            FailureClass::PolicyDenied,
            FailureClass::ValidationFailed,
            FailureClass::Transient,
        ] {
            assert_eq!(FailureClass::parse(class.as_str()), class);
        }
        assert_eq!(FailureClass::parse("mystery"), FailureClass::ExecutionError);
    }
}
