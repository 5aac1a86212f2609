//! Sonia Tools - Tool registry and tiered-risk execution plane.
//!
//! Every tool carries metadata (risk tier, parameter schema, rate limit,
//! timeout); the execution plane validates parameters, consults the
//! policy engine, routes CONFIRM verdicts through an approval gate, and
//! dispatches ALLOW verdicts to the executor implementation with a
//! timeout and output caps. A configured sandbox root contains all
//! filesystem operations; violations are blocked before dispatch and
//! never swallowed.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod executors;
pub mod plane;
pub mod registry;
pub mod sandbox;

pub use error::{ToolError, ToolResult};
pub use executors::{ExecutionContext, ExecutionOutcome, FileExecutor, ShellExecutor, ToolExecutor};
pub use plane::{ApprovalGate, ExecutionResponse, ExecutorPlane, PlaneConfig};
pub use registry::{
    ParameterType, RiskTier, ToolCategory, ToolDefinition, ToolParameter, ToolRegistry,
    ToolUsageStats,
};
pub use sandbox::SandboxRoot;
