//! Sonia State - Durable gateway state store.
//!
//! SQLite-backed persistence for sessions, confirmations, dead letters,
//! the memory write-back outbox, and idempotency keys. In-memory caches
//! in the gateway are the fast path; this store is the crash-safe
//! journal. All public methods are async and best-effort: persistence
//! failures log a warning and never raise to callers, loads fall back to
//! empty.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod migrations;
pub mod records;
pub mod store;

pub use error::{StateError, StateResult};
pub use records::{
    ConfirmationRecord, ConfirmationStatus, DeadLetterRecord, IdempotencyRecord, OutboxEntry,
    RestoreCounts, SessionRecord, SessionStatus,
};
pub use store::{DeadLetterUpdate, SessionUpdate, StateStore};
