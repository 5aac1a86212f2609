//! Sonia Policy - Action safety policy engine.
//!
//! Classifies every inbound action request into one of three verdicts:
//!
//! - `ALLOW` — execute immediately, no user prompt required.
//! - `CONFIRM` — pause execution and require an explicit user approval
//!   token before proceeding. Tokens are short-TTL and single-use.
//! - `DENY` — refuse unconditionally, log, return a structured denial.
//!
//! Rules are evaluated lowest priority number first; first match wins.
//! If no rule matches, the configurable default verdict applies
//! (CONFIRM — safe by default). Every decision is recorded to an
//! in-memory audit log with its trace id and matched rule.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod engine;
pub mod rules;

pub use engine::{ActionVerdict, PolicyDecision, PolicyEngine, PolicyRule};
pub use rules::default_safety_rules;
