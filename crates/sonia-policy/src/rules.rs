//! The canonical safety ruleset.

use crate::engine::{ActionVerdict, PolicyRule};

/// Build the canonical set of safety rules.
///
/// Rule evaluation order (by priority):
/// - 10 — hard deny (destructive commands, sandbox escape attempts)
/// - 20 — read-only allow (reads, listings, health checks)
/// - 50 — confirm (writes, process control, browser)
/// - 90 — catch-all confirm
#[must_use]
#[allow(clippy::vec_init_then_push)]
pub fn default_safety_rules() -> Vec<PolicyRule> {
    let mut rules = Vec::new();

    // ── Priority 10: DENY — always blocked ─────────────────────────
    rules.push(
        PolicyRule::new(
            "deny_destructive_shell",
            ActionVerdict::Deny,
            r"shell\.run",
            &[(
                "command",
                r"(Remove-Item|Clear-Content|Stop-Process|Stop-Service|Set-ExecutionPolicy|Invoke-Expression|IEX|rm\s|del\s|rmdir\s|mkfs|format\s|shutdown\s)",
            )],
            "Block shell commands that delete, kill, or bypass policy",
            10,
        )
        .expect("static rule"),
    );

    rules.push(
        PolicyRule::new(
            "deny_path_escape",
            ActionVerdict::Deny,
            r"file\..*",
            &[("path", r"(\.\.[\\/]|^[A-Za-z]:[\\/]|^[\\/]|\\\\|%|\$\{)")],
            "Block file operations that point outside the sandbox root",
            10,
        )
        .expect("static rule"),
    );

    rules.push(
        PolicyRule::new(
            "deny_unknown_destructive",
            ActionVerdict::Deny,
            r".*\.delete$|.*\.destroy$|.*\.drop$",
            &[],
            "Block any action whose name ends with delete/destroy/drop",
            10,
        )
        .expect("static rule"),
    );

    // ── Priority 20: ALLOW — safe read-only operations ─────────────
    rules.push(
        PolicyRule::new(
            "allow_file_read",
            ActionVerdict::Allow,
            r"file\.read",
            &[],
            "File reads within the sandbox are always allowed",
            20,
        )
        .expect("static rule"),
    );

    rules.push(
        PolicyRule::new(
            "allow_readonly_shell",
            ActionVerdict::Allow,
            r"shell\.run",
            &[(
                "command",
                r"^(ls|cat|head|tail|pwd|stat|file|test\s+-e|ps|Get-ChildItem|Get-Item|Get-Content|Test-Path|Resolve-Path|Get-Location|Get-Process|Get-Service)(\s|$)",
            )],
            "Allow read-only shell commands from the allowlist",
            20,
        )
        .expect("static rule"),
    );

    rules.push(
        PolicyRule::new(
            "allow_health_check",
            ActionVerdict::Allow,
            r"health\.check|healthz",
            &[],
            "Health checks are always allowed",
            20,
        )
        .expect("static rule"),
    );

    // ── Priority 50: CONFIRM — actions that modify state ───────────
    rules.push(
        PolicyRule::new(
            "confirm_file_write",
            ActionVerdict::Confirm,
            r"file\.write",
            &[],
            "File writes require user confirmation",
            50,
        )
        .expect("static rule"),
    );

    rules.push(
        PolicyRule::new(
            "confirm_shell_write",
            ActionVerdict::Confirm,
            r"shell\.run",
            &[],
            "Non-readonly shell commands require confirmation",
            50,
        )
        .expect("static rule"),
    );

    rules.push(
        PolicyRule::new(
            "confirm_browser_open",
            ActionVerdict::Confirm,
            r"browser\.open",
            &[],
            "Opening URLs requires confirmation",
            50,
        )
        .expect("static rule"),
    );

    rules.push(
        PolicyRule::new(
            "confirm_process_control",
            ActionVerdict::Confirm,
            r"process\.(start|stop|kill)",
            &[],
            "Process control requires confirmation",
            50,
        )
        .expect("static rule"),
    );

    // ── Priority 90: catch-all ─────────────────────────────────────
    rules.push(
        PolicyRule::new(
            "confirm_unknown",
            ActionVerdict::Confirm,
            r".*",
            &[],
            "Unknown actions default to confirm",
            90,
        )
        .expect("static rule"),
    );

    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PolicyEngine;
    use serde_json::json;
    use std::collections::HashMap;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(default_safety_rules(), ActionVerdict::Confirm)
    }

    fn shell(command: &str) -> HashMap<String, serde_json::Value> {
        let mut args = HashMap::new();
        args.insert("command".to_string(), json!(command));
        args
    }

    fn file(path: &str) -> HashMap<String, serde_json::Value> {
        let mut args = HashMap::new();
        args.insert("path".to_string(), json!(path));
        args
    }

    #[test]
    fn test_destructive_shell_denied() {
        let e = engine();
        for cmd in ["rm -rf /", "Remove-Item C:\\x", "del tmp", "format c:"] {
            let d = e.evaluate("shell.run", &shell(cmd), "conversation", "t");
            assert_eq!(d.verdict, ActionVerdict::Deny, "{cmd}");
            assert_eq!(d.rule_name, "deny_destructive_shell");
        }
    }

    #[test]
    fn test_readonly_shell_allowed() {
        let e = engine();
        for cmd in ["ls -la", "cat notes.txt", "Get-ChildItem", "pwd"] {
            let d = e.evaluate("shell.run", &shell(cmd), "conversation", "t");
            assert_eq!(d.verdict, ActionVerdict::Allow, "{cmd}");
        }
    }

    #[test]
    fn test_other_shell_confirms() {
        let e = engine();
        let d = e.evaluate("shell.run", &shell("cargo build"), "conversation", "t");
        assert_eq!(d.verdict, ActionVerdict::Confirm);
        assert_eq!(d.rule_name, "confirm_shell_write");
    }

    #[test]
    fn test_path_escape_denied() {
        let e = engine();
        for path in ["../secrets", "/etc/passwd", "C:\\Windows", "\\\\share\\x", "%APPDATA%"] {
            let d = e.evaluate("file.read", &file(path), "conversation", "t");
            assert_eq!(d.verdict, ActionVerdict::Deny, "{path}");
            assert_eq!(d.rule_name, "deny_path_escape");
        }
    }

    #[test]
    fn test_sandboxed_read_allowed_write_confirms() {
        let e = engine();
        let read = e.evaluate("file.read", &file("notes/todo.txt"), "conversation", "t");
        assert_eq!(read.verdict, ActionVerdict::Allow);

        let write = e.evaluate("file.write", &file("notes/todo.txt"), "conversation", "t");
        assert_eq!(write.verdict, ActionVerdict::Confirm);
    }

    #[test]
    fn test_destructive_suffix_denied() {
        let e = engine();
        for action in ["memory.delete", "table.drop", "vm.destroy"] {
            let d = e.evaluate(action, &HashMap::new(), "conversation", "t");
            assert_eq!(d.verdict, ActionVerdict::Deny, "{action}");
            assert_eq!(d.rule_name, "deny_unknown_destructive");
        }
    }

    #[test]
    fn test_health_check_allowed() {
        let e = engine();
        let d = e.evaluate("health.check", &HashMap::new(), "conversation", "t");
        assert_eq!(d.verdict, ActionVerdict::Allow);
    }

    #[test]
    fn test_unknown_action_hits_catch_all() {
        let e = engine();
        let d = e.evaluate("teleport.user", &HashMap::new(), "conversation", "t");
        assert_eq!(d.verdict, ActionVerdict::Confirm);
        assert_eq!(d.rule_name, "confirm_unknown");
    }

    #[test]
    fn test_process_control_confirms() {
        let e = engine();
        for action in ["process.start", "process.stop", "process.kill"] {
            let d = e.evaluate(action, &HashMap::new(), "conversation", "t");
            assert_eq!(d.verdict, ActionVerdict::Confirm, "{action}");
            assert_eq!(d.rule_name, "confirm_process_control");
        }
    }
}
