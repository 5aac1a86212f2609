//! Rule model, decision type, and the evaluator.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use sonia_core::Timestamp;

/// Three-tier safety verdict for every action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionVerdict {
    /// Execute immediately.
    Allow,
    /// Require an approval token first.
    Confirm,
    /// Refuse unconditionally.
    Deny,
}

impl ActionVerdict {
    /// Stable wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Confirm => "confirm",
            Self::Deny => "deny",
        }
    }
}

impl std::fmt::Display for ActionVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single policy rule.
///
/// The action regex must fully match the action name; every arg pattern
/// must find a match in the string-coerced value of its argument; the
/// mode filter, when set, must contain the current mode. All matching is
/// case-insensitive.
#[derive(Debug)]
pub struct PolicyRule {
    /// Human-readable rule identifier.
    pub name: String,
    /// The verdict when this rule matches.
    pub verdict: ActionVerdict,
    /// Why this rule exists (for audit / display).
    pub description: String,
    /// Lower numbers are evaluated first; equal priorities keep
    /// insertion order.
    pub priority: i32,
    mode_filter: Option<HashSet<String>>,
    action_regex: Regex,
    arg_regexes: BTreeMap<String, Regex>,
}

impl PolicyRule {
    /// Build a rule. Regexes compile eagerly so a malformed pattern is a
    /// construction error, not a silent non-match at evaluation time.
    ///
    /// # Errors
    ///
    /// Returns the regex compilation error message.
    pub fn new(
        name: impl Into<String>,
        verdict: ActionVerdict,
        action_pattern: &str,
        arg_patterns: &[(&str, &str)],
        description: impl Into<String>,
        priority: i32,
    ) -> Result<Self, String> {
        let action_regex = RegexBuilder::new(action_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| format!("rule action pattern: {e}"))?;
        let mut arg_regexes = BTreeMap::new();
        for (key, pattern) in arg_patterns {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| format!("rule arg pattern {key}: {e}"))?;
            arg_regexes.insert((*key).to_string(), regex);
        }
        Ok(Self {
            name: name.into(),
            verdict,
            description: description.into(),
            priority,
            mode_filter: None,
            action_regex,
            arg_regexes,
        })
    }

    /// Restrict the rule to the given operational modes.
    #[must_use]
    pub fn with_modes(mut self, modes: &[&str]) -> Self {
        self.mode_filter = Some(modes.iter().map(|m| (*m).to_string()).collect());
        self
    }

    /// Whether this rule matches the given action, args, and mode.
    #[must_use]
    pub fn matches(&self, action: &str, args: &HashMap<String, JsonValue>, mode: &str) -> bool {
        let Some(m) = self.action_regex.find(action) else {
            return false;
        };
        // Full match over the action name
        if m.start() != 0 || m.end() != action.len() {
            return false;
        }

        for (key, regex) in &self.arg_regexes {
            let value = args.get(key).map(coerce_string).unwrap_or_default();
            if !regex.is_match(&value) {
                return false;
            }
        }

        if let Some(filter) = &self.mode_filter {
            if !filter.contains(mode) {
                return false;
            }
        }
        true
    }

    /// Serialize the rule for diagnostics.
    #[must_use]
    pub fn to_summary(&self) -> JsonValue {
        serde_json::json!({
            "name": self.name,
            "verdict": self.verdict.as_str(),
            "action_pattern": self.action_regex.as_str(),
            "arg_patterns": self.arg_regexes.keys().collect::<Vec<_>>(),
            "mode_filter": self.mode_filter.as_ref().map(|f| {
                let mut modes: Vec<_> = f.iter().collect();
                modes.sort();
                modes.into_iter().cloned().collect::<Vec<_>>()
            }),
            "description": self.description,
            "priority": self.priority,
        })
    }
}

/// Result of a policy evaluation. Immutable after creation.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    /// The verdict.
    pub verdict: ActionVerdict,
    /// The evaluated action name.
    pub action: String,
    /// The matched rule, `__default__` when none matched.
    pub rule_name: String,
    /// Correlation / trace identifier.
    pub trace_id: String,
    /// When the decision was made.
    pub timestamp: Timestamp,
    /// Why the rule fired.
    pub reason: String,
    /// Args with long values truncated for the audit record.
    pub args_summary: HashMap<String, String>,
}

const MAX_ARG_SUMMARY_CHARS: usize = 120;

/// Stateless rule evaluator with an in-memory audit log.
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    default_verdict: ActionVerdict,
    audit_log: Mutex<Vec<PolicyDecision>>,
}

impl PolicyEngine {
    /// Create an engine with the given rules and default verdict.
    #[must_use]
    pub fn new(rules: Vec<PolicyRule>, default_verdict: ActionVerdict) -> Self {
        let mut engine = Self {
            rules: Vec::new(),
            default_verdict,
            audit_log: Mutex::new(Vec::new()),
        };
        for rule in rules {
            engine.add_rule(rule);
        }
        engine
    }

    /// Current rule count.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Insert a rule, keeping the list sorted by priority (stable).
    pub fn add_rule(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.priority);
    }

    /// Remove a rule by name. Returns whether it was found.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        self.rules.len() < before
    }

    /// Replace the rule set.
    pub fn reload(&mut self, rules: Vec<PolicyRule>) {
        self.rules.clear();
        for rule in rules {
            self.add_rule(rule);
        }
    }

    /// Evaluate an action against the rule set.
    pub fn evaluate(
        &self,
        action: &str,
        args: &HashMap<String, JsonValue>,
        mode: &str,
        trace_id: &str,
    ) -> PolicyDecision {
        let args_summary: HashMap<String, String> = args
            .iter()
            .map(|(k, v)| {
                let s = coerce_string(v);
                let truncated: String = s.chars().take(MAX_ARG_SUMMARY_CHARS).collect();
                (k.clone(), truncated)
            })
            .collect();

        for rule in &self.rules {
            if rule.matches(action, args, mode) {
                let decision = PolicyDecision {
                    verdict: rule.verdict,
                    action: action.to_string(),
                    rule_name: rule.name.clone(),
                    trace_id: trace_id.to_string(),
                    timestamp: Timestamp::now(),
                    reason: if rule.description.is_empty() {
                        format!("Matched rule '{}'", rule.name)
                    } else {
                        rule.description.clone()
                    },
                    args_summary,
                };
                self.record(&decision);
                return decision;
            }
        }

        let decision = PolicyDecision {
            verdict: self.default_verdict,
            action: action.to_string(),
            rule_name: "__default__".to_string(),
            trace_id: trace_id.to_string(),
            timestamp: Timestamp::now(),
            reason: format!(
                "No rule matched; default verdict = {}",
                self.default_verdict
            ),
            args_summary,
        };
        self.record(&decision);
        decision
    }

    fn record(&self, decision: &PolicyDecision) {
        if let Ok(mut log) = self.audit_log.lock() {
            log.push(decision.clone());
        }
        match decision.verdict {
            ActionVerdict::Allow => debug!(
                verdict = decision.verdict.as_str(),
                action = decision.action,
                rule = decision.rule_name,
                trace = decision.trace_id,
                "policy_decision"
            ),
            ActionVerdict::Confirm => info!(
                verdict = decision.verdict.as_str(),
                action = decision.action,
                rule = decision.rule_name,
                trace = decision.trace_id,
                "policy_decision"
            ),
            ActionVerdict::Deny => warn!(
                verdict = decision.verdict.as_str(),
                action = decision.action,
                rule = decision.rule_name,
                trace = decision.trace_id,
                "policy_decision"
            ),
        }
    }

    /// Number of decisions recorded so far.
    #[must_use]
    pub fn decision_count(&self) -> usize {
        self.audit_log.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// The last `n` decisions, oldest first.
    #[must_use]
    pub fn recent_decisions(&self, n: usize) -> Vec<PolicyDecision> {
        let log = match self.audit_log.lock() {
            Ok(l) => l,
            Err(_) => return Vec::new(),
        };
        let start = log.len().saturating_sub(n);
        log[start..].to_vec()
    }

    /// Clear the audit log.
    pub fn clear_audit_log(&self) {
        if let Ok(mut log) = self.audit_log.lock() {
            log.clear();
        }
    }

    /// Engine state for diagnostics.
    #[must_use]
    pub fn to_summary(&self) -> JsonValue {
        serde_json::json!({
            "rule_count": self.rule_count(),
            "default_verdict": self.default_verdict.as_str(),
            "decision_count": self.decision_count(),
            "rules": self.rules.iter().map(PolicyRule::to_summary).collect::<Vec<_>>(),
        })
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("rule_count", &self.rule_count())
            .field("default_verdict", &self.default_verdict)
            .finish_non_exhaustive()
    }
}

/// String-coerce an argument value the way the audit log and arg
/// patterns see it.
fn coerce_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect()
    }

    fn allow_reads() -> PolicyRule {
        PolicyRule::new(
            "allow_file_read",
            ActionVerdict::Allow,
            r"file\.read",
            &[],
            "reads are safe",
            20,
        )
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Matching
    // -----------------------------------------------------------------------

    #[test]
    fn test_action_pattern_must_fully_match() {
        let rule = allow_reads();
        assert!(rule.matches("file.read", &HashMap::new(), ""));
        assert!(!rule.matches("file.read_all", &HashMap::new(), ""));
        assert!(!rule.matches("myfile.read", &HashMap::new(), ""));
    }

    #[test]
    fn test_arg_patterns_all_must_match() {
        let rule = PolicyRule::new(
            "deny_destructive",
            ActionVerdict::Deny,
            r"shell\.run",
            &[("command", r"(rm\s|del\s)")],
            "",
            10,
        )
        .unwrap();
        assert!(rule.matches("shell.run", &args(&[("command", "rm -rf /tmp/x")]), ""));
        assert!(!rule.matches("shell.run", &args(&[("command", "ls -la")]), ""));
        // Missing arg coerces to empty string and fails the pattern
        assert!(!rule.matches("shell.run", &HashMap::new(), ""));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let rule = PolicyRule::new(
            "deny",
            ActionVerdict::Deny,
            r"shell\.run",
            &[("command", "remove-item")],
            "",
            10,
        )
        .unwrap();
        assert!(rule.matches("SHELL.RUN", &args(&[("command", "Remove-Item x")]), ""));
    }

    #[test]
    fn test_mode_filter() {
        let rule = allow_reads().with_modes(&["conversation"]);
        assert!(rule.matches("file.read", &HashMap::new(), "conversation"));
        assert!(!rule.matches("file.read", &HashMap::new(), "autonomous"));
    }

    #[test]
    fn test_non_string_args_coerced() {
        let rule = PolicyRule::new(
            "port_guard",
            ActionVerdict::Deny,
            r"net\.open",
            &[("port", "^22$")],
            "",
            10,
        )
        .unwrap();
        let mut a = HashMap::new();
        a.insert("port".to_string(), json!(22));
        assert!(rule.matches("net.open", &a, ""));
    }

    #[test]
    fn test_invalid_pattern_is_construction_error() {
        assert!(PolicyRule::new("bad", ActionVerdict::Deny, "(", &[], "", 10).is_err());
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    #[test]
    fn test_priority_order_first_match_wins() {
        let deny = PolicyRule::new(
            "deny_all_shell",
            ActionVerdict::Deny,
            r"shell\.run",
            &[],
            "",
            10,
        )
        .unwrap();
        let allow = PolicyRule::new(
            "allow_all_shell",
            ActionVerdict::Allow,
            r"shell\.run",
            &[],
            "",
            20,
        )
        .unwrap();
        // Insertion order is allow-then-deny; priority still puts deny first
        let engine = PolicyEngine::new(vec![allow, deny], ActionVerdict::Confirm);

        let decision = engine.evaluate("shell.run", &HashMap::new(), "", "t-1");
        assert_eq!(decision.verdict, ActionVerdict::Deny);
        assert_eq!(decision.rule_name, "deny_all_shell");
    }

    #[test]
    fn test_default_verdict_when_nothing_matches() {
        let engine = PolicyEngine::new(vec![allow_reads()], ActionVerdict::Confirm);
        let decision = engine.evaluate("browser.open", &HashMap::new(), "", "t-2");
        assert_eq!(decision.verdict, ActionVerdict::Confirm);
        assert_eq!(decision.rule_name, "__default__");
        assert!(decision.reason.contains("confirm"));
    }

    #[test]
    fn test_args_summary_truncated() {
        let engine = PolicyEngine::new(vec![], ActionVerdict::Confirm);
        let long = "x".repeat(500);
        let decision = engine.evaluate("tool.call", &args(&[("data", &long)]), "", "t-3");
        assert_eq!(decision.args_summary["data"].len(), 120);
    }

    #[test]
    fn test_audit_log_accumulates() {
        let engine = PolicyEngine::new(vec![allow_reads()], ActionVerdict::Confirm);
        engine.evaluate("file.read", &HashMap::new(), "", "t-a");
        engine.evaluate("file.write", &HashMap::new(), "", "t-b");

        assert_eq!(engine.decision_count(), 2);
        let recent = engine.recent_decisions(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].trace_id, "t-b");

        engine.clear_audit_log();
        assert_eq!(engine.decision_count(), 0);
    }

    #[test]
    fn test_remove_and_reload_rules() {
        let mut engine = PolicyEngine::new(vec![allow_reads()], ActionVerdict::Confirm);
        assert!(engine.remove_rule("allow_file_read"));
        assert!(!engine.remove_rule("allow_file_read"));
        assert_eq!(engine.rule_count(), 0);

        engine.reload(vec![allow_reads()]);
        assert_eq!(engine.rule_count(), 1);
    }
}
