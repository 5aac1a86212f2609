//! Sonia Core - Foundation types for the Sonia core runtime.
//!
//! This crate provides:
//! - Prefixed opaque identifier types shared across services
//! - UTC timestamps with the wire format used everywhere (`ISO-8601` with `Z`)
//! - The shared error taxonomy and failure classification
//! - Retry utilities with exponential backoff and jitter

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod ids;
pub mod prelude;
pub mod retry;
pub mod time;

pub use error::{CoreError, CoreResult, FailureClass};
pub use ids::{
    ActionId, AuditId, ConfirmationId, ConflictId, LetterId, MemoryId, OutboxId, SessionId, TurnId,
};
pub use retry::{retry, RetryConfig, RetryOutcome, RetryVerdict};
pub use time::Timestamp;
