//! Bounded log of prior tool calls.
//!
//! The history feeds two consumers: the validation pipeline (warn when a
//! call shape keeps failing) and the tool-planning prompt (short tail of
//! recent activity).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stable hash of a parameter object. Keys are sorted recursively so two
/// objects with the same content always hash alike.
pub fn params_hash(params: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_value(params, &mut hasher);
    hex::encode(hasher.finalize())
}

fn hash_value(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            hasher.update(b"{");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b":");
                hash_value(&map[key], hasher);
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(item, hasher);
            }
            hasher.update(b"]");
        }
        other => hasher.update(other.to_string().as_bytes()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallHistoryEntry {
    /// Canonical tool name.
    pub tool: String,
    pub params_hash: String,
    pub outcome: CallOutcome,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Ring buffer of call outcomes, bounded at `max_size`.
pub struct ToolHistory {
    max_size: usize,
    entries: Mutex<VecDeque<CallHistoryEntry>>,
}

impl ToolHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: Mutex::new(VecDeque::with_capacity(max_size.min(64))),
        }
    }

    pub fn record(&self, tool: &str, params_hash: &str, outcome: CallOutcome, duration_ms: u64) {
        let mut entries = self.entries.lock();
        if entries.len() == self.max_size {
            entries.pop_front();
        }
        entries.push_back(CallHistoryEntry {
            tool: tool.to_string(),
            params_hash: params_hash.to_string(),
            outcome,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    /// Failures of this exact `(tool, params_hash)` currently in the
    /// buffer.
    pub fn failure_count(&self, tool: &str, params_hash: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| {
                e.outcome == CallOutcome::Failure && e.tool == tool && e.params_hash == params_hash
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<CallHistoryEntry> {
        let entries = self.entries.lock();
        entries.iter().rev().take(n).rev().cloned().collect()
    }
}
