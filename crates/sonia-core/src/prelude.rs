//! Convenience re-exports for downstream crates.

pub use crate::error::{CoreError, CoreResult, FailureClass};
pub use crate::ids::{
    ActionId, AuditId, ConfirmationId, ConflictId, LetterId, MemoryId, OutboxId, SessionId, TurnId,
};
pub use crate::retry::{retry, RetryConfig, RetryOutcome, RetryVerdict};
pub use crate::time::{validate_optional_iso, Timestamp};
