//! Sonia DLQ - Dead-letter replay policy engine.
//!
//! Decides whether a dead-lettered action may be replayed. Six ordered
//! checks run per evaluation; the first non-APPROVE short-circuits:
//!
//! 1. Manual block — REJECT
//! 2. Idempotency (already replayed) — REJECT
//! 3. Non-retryable failure class — REJECT
//! 4. Circuit breaker open — DEFER
//! 5. Per-letter cooldown — DEFER
//! 6. Window budget — DEFER
//!
//! Every evaluation produces an immutable trace appended to a bounded
//! ring. Dry-run evaluations return exactly the verdict a real one would
//! at that instant but never stamp cooldowns, consume budget, or touch
//! lineage.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod engine;

pub use engine::{
    BreakerState, CorrelationLineage, DlqReplayPolicyEngine, EvaluationInput, RejectReason,
    ReplayDecision, ReplayTrace, NON_RETRYABLE_CLASSES,
};
