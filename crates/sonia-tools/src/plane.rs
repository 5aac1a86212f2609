//! The execution plane.
//!
//! Glues the registry, the policy engine, the approval gate, and the
//! executor implementations into the execution contract: validate
//! parameters, evaluate policy, mint an approval token for CONFIRM,
//! refuse DENY, and dispatch ALLOW with a timeout, rate limiting, and
//! usage stats.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use sonia_core::ActionId;
use sonia_policy::{ActionVerdict, PolicyEngine};

use crate::error::ToolError;
use crate::executors::{ExecutionContext, ExecutionOutcome, ToolExecutor};
use crate::registry::{RiskTier, ToolRegistry};
use crate::sandbox::SandboxRoot;

/// Hook through which the plane requests approval tokens. Implemented by
/// the gateway confirmation manager; tests plug in stubs.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Mint a single-use approval token for a pending action. Returns
    /// the token id to surface to the user.
    async fn mint(
        &self,
        action_id: &ActionId,
        tool_name: &str,
        args: &HashMap<String, JsonValue>,
        summary: &str,
    ) -> String;
}

/// Plane configuration.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    /// The sandbox root for filesystem tools.
    pub sandbox: SandboxRoot,
    /// Default execution timeout.
    pub default_timeout: Duration,
    /// Hard cap on execution timeout.
    pub max_timeout: Duration,
    /// Output capture cap in bytes.
    pub max_output_bytes: usize,
    /// File size cap in bytes.
    pub max_file_bytes: u64,
    /// Auto-approve tier-1 tools without confirmation.
    pub auto_approve_tier_1: bool,
    /// Current operational mode (feeds policy mode filters).
    pub mode: String,
}

/// Response envelope of one execution request.
#[derive(Debug)]
pub enum ExecutionResponse {
    /// The tool ran.
    Executed {
        /// The action id assigned to this invocation.
        action_id: ActionId,
        /// The captured outcome.
        outcome: ExecutionOutcome,
    },
    /// An approval token was minted; the caller must surface it.
    RequiresApproval {
        /// The pending action.
        action_id: ActionId,
        /// The minted token id.
        approval_token: String,
    },
    /// The policy engine refused the action.
    PolicyDenied {
        /// The denial reason, verbatim.
        reason: String,
    },
    /// No executor implementation is registered for the tool.
    NotImplemented {
        /// The tool name.
        tool_name: String,
    },
}

/// The tool execution plane.
pub struct ExecutorPlane {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    gate: Arc<dyn ApprovalGate>,
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
    config: PlaneConfig,
    /// tool name -> recent call instants (rate limiting)
    call_log: DashMap<String, VecDeque<Instant>>,
}

impl ExecutorPlane {
    /// Build a plane.
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<PolicyEngine>,
        gate: Arc<dyn ApprovalGate>,
        config: PlaneConfig,
    ) -> Self {
        Self {
            registry,
            policy,
            gate,
            executors: HashMap::new(),
            config,
            call_log: DashMap::new(),
        }
    }

    /// Register an executor implementation for a tool name.
    pub fn register_executor(&mut self, name: impl Into<String>, executor: Arc<dyn ToolExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    /// Execute a tool request end-to-end.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] for validation failures, sandbox
    /// violations, rate limiting, and executor failures. Policy denials
    /// and approval requirements are responses, not errors.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: &HashMap<String, JsonValue>,
        timeout_override: Option<Duration>,
    ) -> Result<ExecutionResponse, ToolError> {
        let definition = self
            .registry
            .get_tool(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        // 1. Parameter schema
        let resolved = definition.validate_parameters(args)?;

        // 2. Sandbox containment, before anything else sees the path
        if let Some(path) = resolved.get("path").and_then(JsonValue::as_str) {
            self.config.sandbox.resolve(path)?;
        }

        // 3. Rate limit
        self.check_rate_limit(tool_name, definition.rate_limit_per_minute)?;

        // 4. Policy
        let action_id = ActionId::new();
        let decision =
            self.policy
                .evaluate(tool_name, &resolved, &self.config.mode, action_id.as_str());

        match decision.verdict {
            ActionVerdict::Deny => {
                // Safety refusals are never swallowed
                warn!(tool = tool_name, rule = decision.rule_name, "execution denied");
                return Ok(ExecutionResponse::PolicyDenied {
                    reason: decision.reason,
                });
            }
            ActionVerdict::Confirm => {
                return self.request_approval(&action_id, tool_name, &resolved).await;
            }
            ActionVerdict::Allow => {}
        }

        // 5. Tier gating on top of the policy verdict: tier-3 always
        // confirms, tier-2 confirms in conversation mode, tier-1 unless
        // auto-approved by config
        if self.tier_requires_approval(definition.risk_tier) || definition.requires_approval {
            return self.request_approval(&action_id, tool_name, &resolved).await;
        }

        self.dispatch(&definition.name, action_id, &resolved, timeout_override, definition.timeout_seconds)
            .await
    }

    /// Execute a previously approved action, bypassing policy and tier
    /// gating (the approval token already covered them).
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] for unknown tools and executor failures.
    pub async fn execute_approved(
        &self,
        tool_name: &str,
        action_id: ActionId,
        args: &HashMap<String, JsonValue>,
    ) -> Result<ExecutionResponse, ToolError> {
        let definition = self
            .registry
            .get_tool(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
        let resolved = definition.validate_parameters(args)?;
        if let Some(path) = resolved.get("path").and_then(JsonValue::as_str) {
            self.config.sandbox.resolve(path)?;
        }
        self.dispatch(&definition.name, action_id, &resolved, None, definition.timeout_seconds)
            .await
    }

    async fn request_approval(
        &self,
        action_id: &ActionId,
        tool_name: &str,
        args: &HashMap<String, JsonValue>,
    ) -> Result<ExecutionResponse, ToolError> {
        let summary = summarize(tool_name, args);
        let approval_token = self.gate.mint(action_id, tool_name, args, &summary).await;
        info!(
            tool = tool_name,
            action_id = action_id.as_str(),
            "approval required"
        );
        Ok(ExecutionResponse::RequiresApproval {
            action_id: action_id.clone(),
            approval_token,
        })
    }

    async fn dispatch(
        &self,
        tool_name: &str,
        action_id: ActionId,
        args: &HashMap<String, JsonValue>,
        timeout_override: Option<Duration>,
        tool_timeout_seconds: f64,
    ) -> Result<ExecutionResponse, ToolError> {
        let Some(executor) = self.executors.get(tool_name) else {
            return Ok(ExecutionResponse::NotImplemented {
                tool_name: tool_name.to_string(),
            });
        };

        let timeout = timeout_override
            .unwrap_or_else(|| {
                if tool_timeout_seconds > 0.0 {
                    Duration::from_secs_f64(tool_timeout_seconds)
                } else {
                    self.config.default_timeout
                }
            })
            .min(self.config.max_timeout);

        let ctx = ExecutionContext {
            sandbox: self.config.sandbox.clone(),
            max_output_bytes: self.config.max_output_bytes,
            max_file_bytes: self.config.max_file_bytes,
            timeout,
        };

        let started = Instant::now();
        let result = executor.execute(args, &ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => {
                self.registry.record_execution(tool_name, true, elapsed_ms, None);
                Ok(ExecutionResponse::Executed { action_id, outcome })
            }
            Err(e) => {
                self.registry
                    .record_execution(tool_name, false, elapsed_ms, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    fn tier_requires_approval(&self, tier: RiskTier) -> bool {
        match tier {
            RiskTier::Tier0 => false,
            RiskTier::Tier1 => !self.config.auto_approve_tier_1,
            RiskTier::Tier2 | RiskTier::Tier3 => true,
        }
    }

    fn check_rate_limit(&self, tool_name: &str, limit: u32) -> Result<(), ToolError> {
        if limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut log = self.call_log.entry(tool_name.to_string()).or_default();
        while let Some(front) = log.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                log.pop_front();
            } else {
                break;
            }
        }
        if log.len() >= limit as usize {
            return Err(ToolError::RateLimited {
                tool: tool_name.to_string(),
                limit,
            });
        }
        log.push_back(now);
        Ok(())
    }
}

impl std::fmt::Debug for ExecutorPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPlane")
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn summarize(tool_name: &str, args: &HashMap<String, JsonValue>) -> String {
    let mut parts: Vec<String> = args
        .iter()
        .map(|(k, v)| {
            let s = match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            let truncated: String = s.chars().take(60).collect();
            format!("{k}={truncated}")
        })
        .collect();
    parts.sort();
    format!("{tool_name}({})", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{FileExecutor, ShellExecutor};
    use crate::registry::{ParameterType, ToolCategory, ToolDefinition, ToolParameter};
    use serde_json::json;
    use sonia_policy::default_safety_rules;

    struct RecordingGate;

    #[async_trait]
    impl ApprovalGate for RecordingGate {
        async fn mint(
            &self,
            _action_id: &ActionId,
            _tool_name: &str,
            _args: &HashMap<String, JsonValue>,
            _summary: &str,
        ) -> String {
            "conf_token".to_string()
        }
    }

    fn tool(name: &str, category: ToolCategory, tier: RiskTier) -> ToolDefinition {
        let parameters = match category {
            ToolCategory::Shell => vec![ToolParameter::required("command", ParameterType::String)],
            _ => vec![ToolParameter::required("path", ParameterType::String)],
        };
        ToolDefinition {
            name: name.to_string(),
            description: String::new(),
            category,
            risk_tier: tier,
            parameters,
            requires_approval: false,
            requires_auth: false,
            rate_limit_per_minute: 60,
            timeout_seconds: 5.0,
        }
    }

    fn plane(dir: &std::path::Path) -> ExecutorPlane {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(tool("file.read", ToolCategory::File, RiskTier::Tier0))
            .unwrap();
        registry
            .register(tool("file.write", ToolCategory::File, RiskTier::Tier1))
            .unwrap();
        registry
            .register(tool("shell.run", ToolCategory::Shell, RiskTier::Tier2))
            .unwrap();

        let policy = Arc::new(PolicyEngine::new(
            default_safety_rules(),
            ActionVerdict::Confirm,
        ));
        let config = PlaneConfig {
            sandbox: SandboxRoot::new(dir),
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(15),
            max_output_bytes: 4096,
            max_file_bytes: 1024 * 1024,
            auto_approve_tier_1: false,
            mode: "conversation".to_string(),
        };
        let mut plane = ExecutorPlane::new(registry, policy, Arc::new(RecordingGate), config);
        plane.register_executor("file.read", Arc::new(FileExecutor::new()));
        plane.register_executor("file.write", Arc::new(FileExecutor::new()));
        plane.register_executor("shell.run", Arc::new(ShellExecutor::new()));
        plane
    }

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect()
    }

    #[tokio::test]
    async fn test_tier0_read_executes_directly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "content").unwrap();
        let plane = plane(dir.path());

        let response = plane
            .execute("file.read", &args(&[("path", "a.txt")]), None)
            .await
            .unwrap();
        match response {
            ExecutionResponse::Executed { outcome, .. } => {
                assert_eq!(outcome.result["content"], "content");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tier2_requires_approval() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());

        let response = plane
            .execute("shell.run", &args(&[("command", "cargo build")]), None)
            .await
            .unwrap();
        match response {
            ExecutionResponse::RequiresApproval { approval_token, .. } => {
                assert_eq!(approval_token, "conf_token");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tier1_write_requires_approval_without_auto() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let response = plane
            .execute(
                "file.write",
                &args(&[("path", "x.txt"), ("content", "hi")]),
                None,
            )
            .await
            .unwrap();
        assert!(matches!(response, ExecutionResponse::RequiresApproval { .. }));
    }

    #[tokio::test]
    async fn test_destructive_shell_denied() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let response = plane
            .execute("shell.run", &args(&[("command", "rm -rf /")]), None)
            .await
            .unwrap();
        assert!(matches!(response, ExecutionResponse::PolicyDenied { .. }));
    }

    #[tokio::test]
    async fn test_sandbox_violation_is_error_not_response() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let err = plane
            .execute("file.read", &args(&[("path", "../../etc/passwd")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::SandboxViolation { .. }));
    }

    #[tokio::test]
    async fn test_execute_approved_bypasses_gating() {
        let dir = tempfile::tempdir().unwrap();
        let mut plane = plane(dir.path());
        plane.register_executor("shell.run", Arc::new(ShellExecutor::approved()));

        let response = plane
            .execute_approved("shell.run", ActionId::new(), &args(&[("command", "true")]))
            .await
            .unwrap();
        assert!(matches!(response, ExecutionResponse::Executed { .. }));
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let mut definition = tool("file.read", ToolCategory::File, RiskTier::Tier0);
        definition.rate_limit_per_minute = 2;
        registry.register(definition).unwrap();

        let policy = Arc::new(PolicyEngine::new(
            default_safety_rules(),
            ActionVerdict::Confirm,
        ));
        let config = PlaneConfig {
            sandbox: SandboxRoot::new(dir.path()),
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(15),
            max_output_bytes: 4096,
            max_file_bytes: 1024,
            auto_approve_tier_1: false,
            mode: "conversation".to_string(),
        };
        let mut plane = ExecutorPlane::new(registry, policy, Arc::new(RecordingGate), config);
        plane.register_executor("file.read", Arc::new(FileExecutor::new()));

        for _ in 0..2 {
            plane
                .execute("file.read", &args(&[("path", "a.txt")]), None)
                .await
                .unwrap();
        }
        let err = plane
            .execute("file.read", &args(&[("path", "a.txt")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::RateLimited { limit: 2, .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(dir.path());
        let err = plane
            .execute("teleport.user", &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_stats_recorded_on_execution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let plane = plane(dir.path());
        plane
            .execute("file.read", &args(&[("path", "a.txt")]), None)
            .await
            .unwrap();
        let stats = plane.registry.get_stats("file.read").unwrap();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.successful_calls, 1);
    }
}
