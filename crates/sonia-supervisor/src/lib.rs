//! Sonia Supervisor - Active health supervision for downstream services.
//!
//! Probes every service's health endpoint on a fixed interval, drives a
//! per-service state machine (healthy / degraded / unreachable /
//! recovering), emits typed transition events, and triggers bounded
//! automatic restart with exponential backoff when a service becomes
//! unreachable. Maintenance mode suppresses auto-restart but not
//! probing.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod http;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use http::router;
pub use supervisor::{ProbeOutcome, ServiceRecord, ServiceState, ServiceSupervisor};
