//! Tool metadata, parameter schemas, and the registry.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::error::{ToolError, ToolResult};

/// Worst-case impact classification of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Read-only, no side effects. Never requires approval.
    Tier0,
    /// Local writes, limited scope. May auto-approve by config.
    Tier1,
    /// Process/network side effects. Requires confirmation in
    /// conversation mode.
    Tier2,
    /// Destructive operations. Always requires confirmation.
    Tier3,
}

impl RiskTier {
    /// Stable wire string (`tier_0` … `tier_3`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier0 => "tier_0",
            Self::Tier1 => "tier_1",
            Self::Tier2 => "tier_2",
            Self::Tier3 => "tier_3",
        }
    }
}

/// Functional grouping of tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Filesystem tools.
    File,
    /// Shell tools.
    Shell,
    /// Browser tools.
    Browser,
    /// Desktop automation tools.
    Desktop,
    /// Process control tools.
    Process,
    /// Diagnostics.
    System,
}

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// UTF-8 string.
    String,
    /// Integer or float.
    Number,
    /// Boolean.
    Boolean,
}

/// Schema for one tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub param_type: ParameterType,
    /// Whether the parameter must be supplied.
    pub required: bool,
    /// Default applied when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    /// Allowed values, when enumerated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<JsonValue>>,
    /// Inclusive numeric minimum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive numeric maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Regex the string value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ToolParameter {
    /// A required parameter with no constraints.
    #[must_use]
    pub fn required(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            allowed_values: None,
            min: None,
            max: None,
            pattern: None,
        }
    }

    /// An optional parameter with a default.
    #[must_use]
    pub fn optional(
        name: impl Into<String>,
        param_type: ParameterType,
        default: Option<JsonValue>,
    ) -> Self {
        Self {
            required: false,
            default,
            ..Self::required(name, param_type)
        }
    }

    /// Validate a supplied value against this schema.
    fn validate(&self, value: &JsonValue) -> Result<(), String> {
        match self.param_type {
            ParameterType::String => {
                let Some(s) = value.as_str() else {
                    return Err(format!("{} must be a string", self.name));
                };
                if let Some(pattern) = &self.pattern {
                    let regex = regex::Regex::new(pattern)
                        .map_err(|e| format!("{} pattern invalid: {e}", self.name))?;
                    if !regex.is_match(s) {
                        return Err(format!("{} does not match {pattern}", self.name));
                    }
                }
            }
            ParameterType::Number => {
                let Some(n) = value.as_f64() else {
                    return Err(format!("{} must be a number", self.name));
                };
                if let Some(min) = self.min {
                    if n < min {
                        return Err(format!("{} below minimum {min}", self.name));
                    }
                }
                if let Some(max) = self.max {
                    if n > max {
                        return Err(format!("{} above maximum {max}", self.name));
                    }
                }
            }
            ParameterType::Boolean => {
                if !value.is_boolean() {
                    return Err(format!("{} must be a boolean", self.name));
                }
            }
        }
        if let Some(allowed) = &self.allowed_values {
            if !allowed.contains(value) {
                return Err(format!("{} not in allowed values", self.name));
            }
        }
        Ok(())
    }
}

/// Full metadata for one registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (`file.read`, `shell.run`, …).
    pub name: String,
    /// Human description.
    pub description: String,
    /// Functional category.
    pub category: ToolCategory,
    /// Risk tier.
    pub risk_tier: RiskTier,
    /// Parameter schemas.
    pub parameters: Vec<ToolParameter>,
    /// Whether the tool demands an approval token regardless of tier.
    pub requires_approval: bool,
    /// Whether the caller must be authenticated.
    pub requires_auth: bool,
    /// Calls allowed per minute.
    pub rate_limit_per_minute: u32,
    /// Execution timeout in seconds.
    pub timeout_seconds: f64,
}

impl ToolDefinition {
    /// Validate args against the parameter schemas. Returns the args
    /// with defaults applied.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidParameters`] listing every failure.
    pub fn validate_parameters(
        &self,
        args: &HashMap<String, JsonValue>,
    ) -> ToolResult<HashMap<String, JsonValue>> {
        let mut errors = Vec::new();
        let mut resolved = args.clone();

        for param in &self.parameters {
            match resolved.get(&param.name) {
                Some(value) => {
                    if let Err(e) = param.validate(value) {
                        errors.push(e);
                    }
                }
                None if param.required => {
                    errors.push(format!("missing required parameter: {}", param.name));
                }
                None => {
                    if let Some(default) = &param.default {
                        resolved.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(resolved)
        } else {
            Err(ToolError::InvalidParameters(errors))
        }
    }
}

/// Rolling usage statistics for one tool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolUsageStats {
    /// All calls.
    pub total_calls: u64,
    /// Calls that returned success.
    pub successful_calls: u64,
    /// Calls that failed.
    pub failed_calls: u64,
    /// Total execution time across calls.
    pub total_execution_ms: u64,
    /// Most recent error message.
    pub last_error: Option<String>,
}

impl ToolUsageStats {
    /// Mean execution time per call.
    #[must_use]
    pub fn average_execution_ms(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_execution_ms as f64 / self.total_calls as f64
        }
    }

    /// Fraction of calls that succeeded.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64
        }
    }
}

/// Registry of tool definitions and their usage stats.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, ToolDefinition>>,
    stats: Mutex<HashMap<String, ToolUsageStats>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::AlreadyRegistered`] on a name collision.
    pub fn register(&self, definition: ToolDefinition) -> ToolResult<()> {
        let mut tools = self.lock_tools();
        if tools.contains_key(&definition.name) {
            return Err(ToolError::AlreadyRegistered(definition.name));
        }
        info!(tool = definition.name, tier = definition.risk_tier.as_str(), "tool registered");
        tools.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Remove a tool. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.lock_tools().remove(name).is_some()
    }

    /// Look up a tool definition.
    #[must_use]
    pub fn get_tool(&self, name: &str) -> Option<ToolDefinition> {
        self.lock_tools().get(name).cloned()
    }

    /// List tools, optionally filtered.
    #[must_use]
    pub fn list_tools(
        &self,
        category: Option<ToolCategory>,
        risk_tier: Option<RiskTier>,
    ) -> Vec<ToolDefinition> {
        let tools = self.lock_tools();
        let mut out: Vec<ToolDefinition> = tools
            .values()
            .filter(|t| category.is_none_or(|c| t.category == c))
            .filter(|t| risk_tier.is_none_or(|r| t.risk_tier == r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Record one execution's outcome into the stats.
    pub fn record_execution(&self, name: &str, success: bool, elapsed_ms: u64, error: Option<&str>) {
        let mut stats = self.lock_stats();
        let entry = stats.entry(name.to_string()).or_default();
        entry.total_calls += 1;
        if success {
            entry.successful_calls += 1;
        } else {
            entry.failed_calls += 1;
            entry.last_error = error.map(str::to_string);
        }
        entry.total_execution_ms += elapsed_ms;
    }

    /// Usage stats for one tool.
    #[must_use]
    pub fn get_stats(&self, name: &str) -> Option<ToolUsageStats> {
        self.lock_stats().get(name).cloned()
    }

    /// Export the full tool catalog for diagnostics or an external
    /// registry import.
    #[must_use]
    pub fn export_catalog(&self) -> JsonValue {
        let tools = self.list_tools(None, None);
        serde_json::json!({
            "tool_count": tools.len(),
            "tools": tools,
        })
    }

    /// Registry health snapshot.
    #[must_use]
    pub fn health_check(&self) -> JsonValue {
        let tools = self.lock_tools();
        let stats = self.lock_stats();
        serde_json::json!({
            "tool_count": tools.len(),
            "tools": tools.keys().collect::<Vec<_>>(),
            "total_executions": stats.values().map(|s| s.total_calls).sum::<u64>(),
        })
    }

    fn lock_tools(&self) -> std::sync::MutexGuard<'_, HashMap<String, ToolDefinition>> {
        self.tools.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, HashMap<String, ToolUsageStats>> {
        self.stats.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_tool() -> ToolDefinition {
        ToolDefinition {
            name: "file.read".to_string(),
            description: "Read a file inside the sandbox".to_string(),
            category: ToolCategory::File,
            risk_tier: RiskTier::Tier0,
            parameters: vec![
                ToolParameter::required("path", ParameterType::String),
                ToolParameter::optional("max_bytes", ParameterType::Number, Some(json!(65536))),
            ],
            requires_approval: false,
            requires_auth: false,
            rate_limit_per_minute: 60,
            timeout_seconds: 5.0,
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(read_tool()).unwrap();
        assert!(registry.get_tool("file.read").is_some());
        assert!(matches!(
            registry.register(read_tool()),
            Err(ToolError::AlreadyRegistered(_))
        ));
        assert!(registry.unregister("file.read"));
        assert!(!registry.unregister("file.read"));
    }

    #[test]
    fn test_validate_applies_defaults() {
        let tool = read_tool();
        let mut args = HashMap::new();
        args.insert("path".to_string(), json!("notes.txt"));
        let resolved = tool.validate_parameters(&args).unwrap();
        assert_eq!(resolved["max_bytes"], json!(65536));
    }

    #[test]
    fn test_validate_missing_required() {
        let tool = read_tool();
        let err = tool.validate_parameters(&HashMap::new()).unwrap_err();
        match err {
            ToolError::InvalidParameters(errors) => {
                assert!(errors[0].contains("path"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validate_type_and_range() {
        let mut tool = read_tool();
        tool.parameters[1].min = Some(1.0);
        tool.parameters[1].max = Some(100.0);

        let mut args = HashMap::new();
        args.insert("path".to_string(), json!("x"));
        args.insert("max_bytes".to_string(), json!(1000));
        assert!(tool.validate_parameters(&args).is_err());

        args.insert("max_bytes".to_string(), json!("not a number"));
        assert!(tool.validate_parameters(&args).is_err());

        args.insert("max_bytes".to_string(), json!(50));
        assert!(tool.validate_parameters(&args).is_ok());
    }

    #[test]
    fn test_validate_enum_and_pattern() {
        let mut tool = read_tool();
        tool.parameters[0].pattern = Some(r"\.txt$".to_string());
        let mut args = HashMap::new();
        args.insert("path".to_string(), json!("binary.bin"));
        assert!(tool.validate_parameters(&args).is_err());
        args.insert("path".to_string(), json!("notes.txt"));
        assert!(tool.validate_parameters(&args).is_ok());
    }

    #[test]
    fn test_list_filters() {
        let registry = ToolRegistry::new();
        registry.register(read_tool()).unwrap();
        let mut shell = read_tool();
        shell.name = "shell.run".to_string();
        shell.category = ToolCategory::Shell;
        shell.risk_tier = RiskTier::Tier2;
        registry.register(shell).unwrap();

        assert_eq!(registry.list_tools(None, None).len(), 2);
        assert_eq!(
            registry.list_tools(Some(ToolCategory::Shell), None)[0].name,
            "shell.run"
        );
        assert_eq!(registry.list_tools(None, Some(RiskTier::Tier0)).len(), 1);
    }

    #[test]
    fn test_export_catalog_shape() {
        let registry = ToolRegistry::new();
        registry.register(read_tool()).unwrap();
        let catalog = registry.export_catalog();
        assert_eq!(catalog["tool_count"], 1);
        assert_eq!(catalog["tools"][0]["name"], "file.read");
        assert_eq!(catalog["tools"][0]["risk_tier"], "tier_0");
    }

    #[test]
    fn test_stats_accumulate() {
        let registry = ToolRegistry::new();
        registry.record_execution("file.read", true, 12, None);
        registry.record_execution("file.read", false, 8, Some("boom"));

        let stats = registry.get_stats("file.read").unwrap();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
        assert!((stats.average_execution_ms() - 10.0).abs() < 1e-9);
        assert!((stats.success_rate() - 0.5).abs() < 1e-9);
    }
}
