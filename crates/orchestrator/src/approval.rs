//! Human approval workflow for gated tool batches.
//!
//! When the inspector returns `require_approval`, the executor parks the
//! item here until the client answers `POST /session/confirm` or the
//! timeout downgrades the decision to deny.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use td_domain::cancel::CancelToken;
use td_domain::tool::ToolCall;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A pending approval waiting for the client's confirm message.
struct PendingApproval {
    id: Uuid,
    respond: oneshot::Sender<bool>,
}

/// Serializable snapshot for events and introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub session_id: String,
    pub reason: String,
    pub tools: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// At most one pending approval per session (the whole batch suspends).
pub struct ApprovalStore {
    pending: RwLock<HashMap<String, PendingApproval>>,
    timeout: Duration,
}

impl ApprovalStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a pending approval and wait for the decision.
    ///
    /// Resolves `false` on timeout, cancellation, or an explicit deny.
    pub async fn wait_for_decision(
        &self,
        session_id: &str,
        reason: &str,
        calls: &[ToolCall],
        cancel: &CancelToken,
    ) -> (ApprovalInfo, bool) {
        let (tx, rx) = oneshot::channel();
        let info = ApprovalInfo {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            reason: reason.to_string(),
            tools: calls.iter().map(|c| c.tool.clone()).collect(),
            created_at: Utc::now(),
        };
        self.pending.write().insert(
            session_id.to_string(),
            PendingApproval { id: info.id, respond: tx },
        );

        let decision = tokio::select! {
            res = rx => res.unwrap_or(false),
            _ = tokio::time::sleep(self.timeout) => {
                tracing::info!(session_id = %session_id, "approval timed out, denying");
                false
            }
            _ = poll_cancelled(cancel) => {
                tracing::info!(session_id = %session_id, "session cancelled, denying approval");
                false
            }
        };

        self.pending.write().remove(session_id);
        (info, decision)
    }

    /// Resolve the session's pending approval. Returns `false` when
    /// nothing was pending.
    pub fn resolve(&self, session_id: &str, confirmed: bool) -> bool {
        if let Some(pending) = self.pending.write().remove(session_id) {
            let _ = pending.respond.send(confirmed);
            return true;
        }
        false
    }

    /// Whether a session currently has a pending approval.
    pub fn is_pending(&self, session_id: &str) -> bool {
        self.pending.read().contains_key(session_id)
    }

    /// Deny the session's pending approval if any (used on cancel).
    pub fn deny_pending(&self, session_id: &str) {
        self.resolve(session_id, false);
    }
}

async fn poll_cancelled(cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn call() -> ToolCall {
        ToolCall {
            provider: "shell".into(),
            tool: "shell__run_command".into(),
            parameters: serde_json::json!({ "command": "sudo ls" }),
            reasoning: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_resolves_to_approved() {
        let store = Arc::new(ApprovalStore::new(Duration::from_secs(60)));
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .wait_for_decision("s1", "sudo", &[call()], &CancelToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.is_pending("s1"));
        assert!(store.resolve("s1", true));

        let (_, approved) = waiter.await.unwrap();
        assert!(approved);
        assert!(!store.is_pending("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn deny_resolves_to_denied() {
        let store = Arc::new(ApprovalStore::new(Duration::from_secs(60)));
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .wait_for_decision("s1", "sudo", &[call()], &CancelToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.resolve("s1", false);
        let (_, approved) = waiter.await.unwrap();
        assert!(!approved);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_downgrades_to_deny() {
        let store = ApprovalStore::new(Duration::from_secs(60));
        let (_, approved) = store
            .wait_for_decision("s1", "sudo", &[call()], &CancelToken::new())
            .await;
        assert!(!approved);
        assert!(!store.is_pending("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unblocks_with_deny() {
        let store = Arc::new(ApprovalStore::new(Duration::from_secs(600)));
        let cancel = CancelToken::new();
        let waiter = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                store.wait_for_decision("s1", "sudo", &[call()], &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let (_, approved) = waiter.await.unwrap();
        assert!(!approved);
    }

    #[tokio::test]
    async fn resolve_without_pending_returns_false() {
        let store = ApprovalStore::new(Duration::from_secs(60));
        assert!(!store.resolve("nobody", true));
    }
}
