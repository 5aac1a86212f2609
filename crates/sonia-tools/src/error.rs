//! Tool plane error types.

use thiserror::Error;

/// Errors raised by the tool registry and executors.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The requested tool is not registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A tool with this name is already registered.
    #[error("tool already registered: {0}")]
    AlreadyRegistered(String),

    /// Arguments failed the tool's parameter schema.
    #[error("parameter validation failed: {}", .0.join("; "))]
    InvalidParameters(Vec<String>),

    /// A path argument escaped the sandbox root. Never swallowed.
    #[error("path outside sandbox: {path}")]
    SandboxViolation {
        /// The offending path as supplied.
        path: String,
    },

    /// The shell command is not on the executor's allowlist.
    #[error("command not allowlisted: {0}")]
    CommandNotAllowlisted(String),

    /// A file exceeded the configured size cap.
    #[error("file too large: {path} is {size} bytes (cap {cap})")]
    FileTooLarge {
        /// The file.
        path: String,
        /// Its size.
        size: u64,
        /// The configured cap.
        cap: u64,
    },

    /// The per-minute rate limit for the tool was exceeded.
    #[error("rate limit exceeded for {tool}: {limit} calls per minute")]
    RateLimited {
        /// The tool.
        tool: String,
        /// The configured limit.
        limit: u32,
    },

    /// Execution exceeded the tool's timeout.
    #[error("tool {tool} timed out after {timeout_ms}ms")]
    Timeout {
        /// The tool.
        tool: String,
        /// The budget that was exceeded.
        timeout_ms: u64,
    },

    /// The executor process could not be spawned or failed internally.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Filesystem failure inside the sandbox.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;
