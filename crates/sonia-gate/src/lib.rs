//! Sonia Gate - Promotion gate runner.
//!
//! Runs a fixed list of gate scripts grouped into classes:
//!
//! - **A** — inherited floor. Known-green; any failure is retried once
//!   (resource contention from concurrent subprocess spawning is the
//!   usual cause) and a confirmed failure trips fail-fast HOLD.
//! - **B** — delta gates for the release under evaluation.
//! - **C** — cross-cutting evidence gates.
//!
//! Failures classify as `deterministic_fail`, `transient_fail`,
//! `timeout`, or `not_found`. Ambiguous failures (empty output,
//! subprocess noise) retry once after a randomized backoff; a pass on
//! retry is recorded as `PASS_WITH_RETRY` with the first attempt's
//! evidence preserved. The run produces a matrix JSON with the overall
//! `PROMOTE` / `HOLD` verdict.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod runner;

pub use runner::{
    GateClass, GateFailureClass, GateMatrix, GateOutcome, GateRunner, GateRunnerConfig, GateSpec,
};
