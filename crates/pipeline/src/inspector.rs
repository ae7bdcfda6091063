//! Tool inspector — safety, permission, and repetition checks gating
//! execution.
//!
//! Runs after validation and immediately before dispatch, on the final
//! post-correction call. Repetition counters are updated on dispatch,
//! not on validation, so a call that never executes is never counted.

use std::collections::HashMap;

use parking_lot::Mutex;
use regex::RegexSet;
use serde::Serialize;

use td_domain::config::{InspectorConfig, Mode};
use td_domain::error::{Error, Result};
use td_domain::tool::{split_canonical, ToolCall};

use crate::history::params_hash;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call verdict, ordered by strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionDecision {
    Allow,
    RequireApproval,
    Deny,
}

#[derive(Debug, Clone)]
pub struct Inspection {
    pub decision: InspectionDecision,
    pub reason: Option<String>,
}

impl Inspection {
    fn allow() -> Self {
        Self {
            decision: InspectionDecision::Allow,
            reason: None,
        }
    }

    fn of(decision: InspectionDecision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: Some(reason.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inspector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default, Debug)]
struct SessionCounters {
    last_key: Option<String>,
    consecutive: u32,
    totals: HashMap<String, u32>,
}

#[derive(Debug)]
pub struct Inspector {
    config: InspectorConfig,
    deny_set: RegexSet,
    approval_set: RegexSet,
    sessions: Mutex<HashMap<String, SessionCounters>>,
}

/// Action name prefixes considered read-only for the permission table.
const READ_PREFIXES: &[&str] = &[
    "read", "get", "list", "search", "query", "stat", "fetch", "screenshot", "snapshot", "capture",
    "view",
];

impl Inspector {
    /// Compile the configured pattern sets once at startup.
    pub fn new(config: InspectorConfig) -> Result<Self> {
        let deny_set = RegexSet::new(&config.deny_patterns)
            .map_err(|e| Error::Config(format!("inspector deny pattern: {e}")))?;
        let approval_set = RegexSet::new(&config.approval_patterns)
            .map_err(|e| Error::Config(format!("inspector approval pattern: {e}")))?;
        Ok(Self {
            config,
            deny_set,
            approval_set,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Inspect a single call for the given session and mode.
    pub fn inspect(&self, session_id: &str, mode: Mode, call: &ToolCall) -> Inspection {
        let mut strictest = Inspection::allow();
        let mut raise = |candidate: Inspection| {
            if candidate.decision > strictest.decision {
                strictest = candidate;
            }
        };

        raise(self.check_safety(call));
        raise(self.check_permission(mode, call));
        raise(self.check_repetition(session_id, call));

        strictest
    }

    /// Inspect a batch; the result is the strictest per-call decision.
    pub fn inspect_batch(&self, session_id: &str, mode: Mode, calls: &[ToolCall]) -> Inspection {
        calls
            .iter()
            .map(|call| self.inspect(session_id, mode, call))
            .max_by_key(|i| i.decision)
            .unwrap_or_else(Inspection::allow)
    }

    /// Record that a call was actually dispatched.
    pub fn record_dispatch(&self, session_id: &str, call: &ToolCall) {
        let key = repetition_key(call);
        let mut sessions = self.sessions.lock();
        let counters = sessions.entry(session_id.to_string()).or_default();
        if counters.last_key.as_deref() == Some(key.as_str()) {
            counters.consecutive += 1;
        } else {
            counters.consecutive = 1;
            counters.last_key = Some(key.clone());
        }
        *counters.totals.entry(key).or_insert(0) += 1;
    }

    /// Drop a session's repetition counters.
    pub fn clear_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    // ── Checks ───────────────────────────────────────────────────────

    fn check_safety(&self, call: &ToolCall) -> Inspection {
        let haystack = safety_haystack(call);
        if let Some(idx) = self.deny_set.matches(&haystack).into_iter().next() {
            return Inspection::of(
                InspectionDecision::Deny,
                format!("matched dangerous pattern '{}'", self.config.deny_patterns[idx]),
            );
        }
        if let Some(idx) = self.approval_set.matches(&haystack).into_iter().next() {
            return Inspection::of(
                InspectionDecision::RequireApproval,
                format!("matched approval pattern '{}'", self.config.approval_patterns[idx]),
            );
        }
        Inspection::allow()
    }

    fn check_permission(&self, mode: Mode, call: &ToolCall) -> Inspection {
        let action = split_canonical(&call.tool)
            .map(|(_, action)| action)
            .unwrap_or(call.tool.as_str());
        if is_read_only(action) {
            return Inspection::allow();
        }

        match mode {
            Mode::Chat => Inspection::of(
                InspectionDecision::Deny,
                format!("'{action}' is not read-only; chat mode permits read-only tools"),
            ),
            Mode::Task => self.check_write_paths(call, &self.config.allowed_write_prefixes),
            Mode::Dev => self.check_write_paths(call, &self.config.dev_write_prefixes),
        }
    }

    /// Write-like calls touching paths outside the allow-listed prefixes
    /// need a human in the loop.
    fn check_write_paths(&self, call: &ToolCall, prefixes: &[String]) -> Inspection {
        for path in path_like_params(call) {
            if !prefixes.iter().any(|p| path.starts_with(p.as_str())) {
                return Inspection::of(
                    InspectionDecision::RequireApproval,
                    format!("write touches '{path}' outside the allowed prefixes"),
                );
            }
        }
        Inspection::allow()
    }

    fn check_repetition(&self, session_id: &str, call: &ToolCall) -> Inspection {
        let key = repetition_key(call);
        let sessions = self.sessions.lock();
        let Some(counters) = sessions.get(session_id) else {
            return Inspection::allow();
        };

        if counters.last_key.as_deref() == Some(key.as_str())
            && counters.consecutive >= self.config.max_consecutive
        {
            return Inspection::of(
                InspectionDecision::Deny,
                format!(
                    "identical call repeated {} times in direct succession",
                    counters.consecutive
                ),
            );
        }
        let total = counters.totals.get(&key).copied().unwrap_or(0);
        if total >= self.config.max_total {
            return Inspection::of(
                InspectionDecision::Deny,
                format!("identical call executed {total} times this session"),
            );
        }
        Inspection::allow()
    }
}

fn repetition_key(call: &ToolCall) -> String {
    format!("{}:{}", call.tool, params_hash(&call.parameters))
}

fn is_read_only(action: &str) -> bool {
    READ_PREFIXES
        .iter()
        .any(|p| action == *p || action.starts_with(&format!("{p}_")) || action.ends_with(&format!("_{p}")))
}

/// Everything worth matching safety patterns against: the tool name and
/// every string value in the parameters.
fn safety_haystack(call: &ToolCall) -> String {
    let mut parts = vec![call.tool.clone()];
    collect_strings(&call.parameters, &mut parts);
    parts.join(" ")
}

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// String parameters that look like filesystem paths.
fn path_like_params(call: &ToolCall) -> Vec<String> {
    let mut strings = Vec::new();
    collect_strings(&call.parameters, &mut strings);
    strings
        .into_iter()
        .filter(|s| s.starts_with('/') || s.starts_with("./") || s.starts_with("~/"))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn inspector() -> Inspector {
        Inspector::new(InspectorConfig::default()).unwrap()
    }

    fn call(tool: &str, params: serde_json::Value) -> ToolCall {
        let provider = split_canonical(tool).map(|(p, _)| p).unwrap_or("shell");
        ToolCall {
            provider: provider.into(),
            tool: tool.into(),
            parameters: params,
            reasoning: String::new(),
        }
    }

    #[test]
    fn destructive_command_is_denied() {
        let i = inspector();
        let c = call(
            "shell__run_command",
            serde_json::json!({ "command": "rm -rf / --no-preserve-root" }),
        );
        let result = i.inspect("s1", Mode::Task, &c);
        assert_eq!(result.decision, InspectionDecision::Deny);
        assert!(result.reason.unwrap().contains("dangerous pattern"));
    }

    #[test]
    fn sudo_requires_approval() {
        let i = inspector();
        let c = call(
            "shell__run_command",
            serde_json::json!({ "command": "sudo systemctl restart nginx" }),
        );
        assert_eq!(
            i.inspect("s1", Mode::Task, &c).decision,
            InspectionDecision::RequireApproval
        );
    }

    #[test]
    fn chat_mode_permits_reads_only() {
        let i = inspector();
        let read = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/x" }));
        assert_eq!(i.inspect("s1", Mode::Chat, &read).decision, InspectionDecision::Allow);

        let write = call(
            "filesystem__write_file",
            serde_json::json!({ "path": "/tmp/y", "content": "ok" }),
        );
        assert_eq!(i.inspect("s1", Mode::Chat, &write).decision, InspectionDecision::Deny);
    }

    #[test]
    fn task_mode_write_inside_prefix_is_allowed() {
        let i = inspector();
        let c = call(
            "filesystem__write_file",
            serde_json::json!({ "path": "/tmp/out.txt", "content": "ok" }),
        );
        assert_eq!(i.inspect("s1", Mode::Task, &c).decision, InspectionDecision::Allow);
    }

    #[test]
    fn task_mode_write_outside_prefix_requires_approval() {
        let i = inspector();
        let c = call(
            "filesystem__write_file",
            serde_json::json!({ "path": "/etc/passwd", "content": "x" }),
        );
        assert_eq!(
            i.inspect("s1", Mode::Task, &c).decision,
            InspectionDecision::RequireApproval
        );
    }

    #[test]
    fn dev_mode_write_limited_to_own_tree() {
        let i = inspector();
        let inside = call(
            "filesystem__write_file",
            serde_json::json!({ "path": "./logs/analysis.md" }),
        );
        assert_eq!(i.inspect("s1", Mode::Dev, &inside).decision, InspectionDecision::Allow);

        let outside = call(
            "filesystem__write_file",
            serde_json::json!({ "path": "/tmp/elsewhere" }),
        );
        assert_eq!(
            i.inspect("s1", Mode::Dev, &outside).decision,
            InspectionDecision::RequireApproval
        );
    }

    #[test]
    fn consecutive_repetition_is_denied() {
        let i = inspector();
        let c = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/x" }));
        for _ in 0..3 {
            assert_eq!(i.inspect("s1", Mode::Task, &c).decision, InspectionDecision::Allow);
            i.record_dispatch("s1", &c);
        }
        let result = i.inspect("s1", Mode::Task, &c);
        assert_eq!(result.decision, InspectionDecision::Deny);
        assert!(result.reason.unwrap().contains("succession"));
    }

    #[test]
    fn interleaved_calls_reset_consecutive_counter() {
        let i = inspector();
        let a = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/a" }));
        let b = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/b" }));
        for _ in 0..2 {
            i.record_dispatch("s1", &a);
        }
        i.record_dispatch("s1", &b);
        i.record_dispatch("s1", &a);
        assert_eq!(i.inspect("s1", Mode::Task, &a).decision, InspectionDecision::Allow);
    }

    #[test]
    fn total_repetition_is_denied() {
        let i = inspector();
        let a = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/a" }));
        let b = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/b" }));
        // Interleave so the consecutive limit never trips.
        for _ in 0..10 {
            i.record_dispatch("s1", &a);
            i.record_dispatch("s1", &b);
        }
        let result = i.inspect("s1", Mode::Task, &a);
        assert_eq!(result.decision, InspectionDecision::Deny);
        assert!(result.reason.unwrap().contains("this session"));
    }

    #[test]
    fn counters_are_per_session() {
        let i = inspector();
        let c = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/x" }));
        for _ in 0..3 {
            i.record_dispatch("s1", &c);
        }
        assert_eq!(i.inspect("s2", Mode::Task, &c).decision, InspectionDecision::Allow);
    }

    #[test]
    fn clear_session_resets_counters() {
        let i = inspector();
        let c = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/x" }));
        for _ in 0..3 {
            i.record_dispatch("s1", &c);
        }
        i.clear_session("s1");
        assert_eq!(i.inspect("s1", Mode::Task, &c).decision, InspectionDecision::Allow);
    }

    #[test]
    fn batch_decision_is_strictest() {
        let i = inspector();
        let read = call("filesystem__read_file", serde_json::json!({ "path": "/tmp/x" }));
        let sudo = call(
            "shell__run_command",
            serde_json::json!({ "command": "sudo rm file" }),
        );
        let batch = [read, sudo];
        assert_eq!(
            i.inspect_batch("s1", Mode::Task, &batch).decision,
            InspectionDecision::RequireApproval
        );
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let mut config = InspectorConfig::default();
        config.deny_patterns.push("(".into());
        let err = Inspector::new(config).unwrap_err();
        assert_eq!(err.kind(), "config-error");
    }
}
