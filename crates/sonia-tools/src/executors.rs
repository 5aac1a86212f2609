//! Tool executor implementations.
//!
//! Executors are capability objects dispatched by registry name. The
//! shell executor enforces its own read-only allowlist in addition to
//! the policy engine; the file executor enforces the sandbox root and
//! size caps on both read and write.

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{ToolError, ToolResult};
use crate::sandbox::SandboxRoot;

/// Execution environment shared by executors.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The sandbox containing all filesystem operations.
    pub sandbox: SandboxRoot,
    /// Output capture cap in bytes.
    pub max_output_bytes: usize,
    /// File read/write size cap in bytes.
    pub max_file_bytes: u64,
    /// Execution timeout.
    pub timeout: Duration,
}

/// Captured outcome of one tool execution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionOutcome {
    /// Captured stdout (capped).
    pub stdout: String,
    /// Captured stderr (capped).
    pub stderr: String,
    /// Process exit code, when a process ran.
    pub exit_code: Option<i32>,
    /// Structured result payload.
    pub result: JsonValue,
}

/// A tool executor implementation.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The registry name this executor serves.
    fn name(&self) -> &str;

    /// Execute with validated arguments.
    async fn execute(
        &self,
        args: &HashMap<String, JsonValue>,
        ctx: &ExecutionContext,
    ) -> ToolResult<ExecutionOutcome>;
}

// ---------------------------------------------------------------------------
// Shell
// ---------------------------------------------------------------------------

/// Read-only command forms the shell executor accepts on its own
/// authority. Anything else must arrive pre-approved.
const SHELL_ALLOWLIST: &str = r"^(ls|cat|head|tail|pwd|stat|file|wc|grep|find|ps|df|du|date|uname|test\s+-e|echo)(\s|$)";

/// Shell tool executor (`shell.run`).
#[derive(Debug)]
pub struct ShellExecutor {
    allowlist: regex::Regex,
    /// Accept any command (used after explicit approval).
    approved_mode: bool,
}

impl ShellExecutor {
    /// Executor that enforces the read-only allowlist.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allowlist: RegexBuilder::new(SHELL_ALLOWLIST)
                .case_insensitive(true)
                .build()
                .expect("static allowlist"),
            approved_mode: false,
        }
    }

    /// Executor for already-approved actions; skips the allowlist.
    #[must_use]
    pub fn approved() -> Self {
        Self {
            approved_mode: true,
            ..Self::new()
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell.run"
    }

    async fn execute(
        &self,
        args: &HashMap<String, JsonValue>,
        ctx: &ExecutionContext,
    ) -> ToolResult<ExecutionOutcome> {
        let command = args
            .get("command")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ToolError::InvalidParameters(vec!["missing command".to_string()]))?;

        if !self.approved_mode && !self.allowlist.is_match(command) {
            return Err(ToolError::CommandNotAllowlisted(command.to_string()));
        }

        debug!(command, "spawning shell command");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(ctx.sandbox.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("spawn failed: {e}")))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let cap = ctx.max_output_bytes;

        let waited = tokio::time::timeout(ctx.timeout, async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            let status = child.wait().await;
            (stdout, stderr, status)
        })
        .await;

        let (stdout, stderr, status) = match waited {
            Ok(v) => v,
            Err(_) => {
                // A timed-out command is killed rather than left running
                let _ = child.kill().await;
                return Err(ToolError::Timeout {
                    tool: self.name().to_string(),
                    timeout_ms: ctx.timeout.as_millis() as u64,
                });
            }
        };

        let status =
            status.map_err(|e| ToolError::ExecutionFailed(format!("wait failed: {e}")))?;
        let stdout = cap_output(&stdout, cap);
        let stderr = cap_output(&stderr, cap);
        let exit_code = status.code();

        Ok(ExecutionOutcome {
            result: json!({
                "exit_code": exit_code,
                "stdout_bytes": stdout.len(),
            }),
            stdout,
            stderr,
            exit_code,
        })
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// File tool executor (`file.read` / `file.write`).
#[derive(Debug, Default)]
pub struct FileExecutor;

impl FileExecutor {
    /// Create the executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn read(
        &self,
        args: &HashMap<String, JsonValue>,
        ctx: &ExecutionContext,
    ) -> ToolResult<ExecutionOutcome> {
        let supplied = path_arg(args)?;
        let path = ctx.sandbox.resolve(supplied)?;

        let metadata = tokio::fs::metadata(&path).await?;
        if metadata.len() > ctx.max_file_bytes {
            return Err(ToolError::FileTooLarge {
                path: supplied.to_string(),
                size: metadata.len(),
                cap: ctx.max_file_bytes,
            });
        }

        let content = tokio::fs::read_to_string(&path).await?;
        Ok(ExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            result: json!({
                "path": path.display().to_string(),
                "size_bytes": metadata.len(),
                "content": content,
            }),
        })
    }

    async fn write(
        &self,
        args: &HashMap<String, JsonValue>,
        ctx: &ExecutionContext,
    ) -> ToolResult<ExecutionOutcome> {
        let supplied = path_arg(args)?;
        let content = args
            .get("content")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ToolError::InvalidParameters(vec!["missing content".to_string()]))?;

        if content.len() as u64 > ctx.max_file_bytes {
            return Err(ToolError::FileTooLarge {
                path: supplied.to_string(),
                size: content.len() as u64,
                cap: ctx.max_file_bytes,
            });
        }

        let path = ctx.sandbox.resolve(supplied)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        Ok(ExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            result: json!({
                "path": path.display().to_string(),
                "bytes_written": content.len(),
            }),
        })
    }
}

#[async_trait]
impl ToolExecutor for FileExecutor {
    fn name(&self) -> &str {
        "file"
    }

    async fn execute(
        &self,
        args: &HashMap<String, JsonValue>,
        ctx: &ExecutionContext,
    ) -> ToolResult<ExecutionOutcome> {
        let operation = args
            .get("operation")
            .and_then(JsonValue::as_str)
            .unwrap_or("read");
        match operation {
            "write" => self.write(args, ctx).await,
            _ => self.read(args, ctx).await,
        }
    }
}

fn path_arg(args: &HashMap<String, JsonValue>) -> ToolResult<&str> {
    args.get("path")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ToolError::InvalidParameters(vec!["missing path".to_string()]))
}

fn cap_output(bytes: &[u8], cap: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars().take(cap).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(dir: &std::path::Path) -> ExecutionContext {
        ExecutionContext {
            sandbox: SandboxRoot::new(dir),
            max_output_bytes: 4096,
            max_file_bytes: 1024,
            timeout: Duration::from_secs(5),
        }
    }

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Shell
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_shell_allowlisted_command_runs() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::new();
        let outcome = exec
            .execute(&args(&[("command", "echo hello")]), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_shell_rejects_unlisted_command() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::new();
        let err = exec
            .execute(&args(&[("command", "curl http://example.com")]), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::CommandNotAllowlisted(_)));
    }

    #[tokio::test]
    async fn test_shell_approved_mode_skips_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::approved();
        let outcome = exec
            .execute(&args(&[("command", "true")]), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_shell_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::approved();
        let mut context = ctx(dir.path());
        context.timeout = Duration::from_millis(100);
        let err = exec
            .execute(&args(&[("command", "sleep 5")]), &context)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_shell_output_capped() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::approved();
        let mut context = ctx(dir.path());
        context.max_output_bytes = 10;
        let outcome = exec
            .execute(
                &args(&[("command", "echo aaaaaaaaaaaaaaaaaaaaaaaaaaaaa")]),
                &context,
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout.len(), 10);
    }

    // -----------------------------------------------------------------------
    // File
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_file_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FileExecutor::new();
        let context = ctx(dir.path());

        exec.execute(
            &args(&[("operation", "write"), ("path", "notes/a.txt"), ("content", "hi")]),
            &context,
        )
        .await
        .unwrap();

        let read = exec
            .execute(&args(&[("path", "notes/a.txt")]), &context)
            .await
            .unwrap();
        assert_eq!(read.result["content"], "hi");
    }

    #[tokio::test]
    async fn test_file_sandbox_escape_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FileExecutor::new();
        let err = exec
            .execute(&args(&[("path", "../../etc/passwd")]), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::SandboxViolation { .. }));
    }

    #[tokio::test]
    async fn test_file_write_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FileExecutor::new();
        let big = "x".repeat(2000);
        let err = exec
            .execute(
                &args(&[("operation", "write"), ("path", "big.txt"), ("content", &big)]),
                &ctx(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::FileTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_file_read_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "y".repeat(2000)).unwrap();
        let exec = FileExecutor::new();
        let err = exec
            .execute(&args(&[("path", "big.txt")]), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::FileTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_file_read_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FileExecutor::new();
        let err = exec
            .execute(&args(&[("path", "absent.txt")]), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Io(_)));
    }
}
