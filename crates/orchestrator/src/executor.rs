//! TODO executor — the per-item loop at the heart of the workflow.
//!
//! The executor owns all mutable workflow state and sequences the nine
//! stages over it. Items run one at a time per session, in insertion
//! order among those whose dependencies have completed. Blocked items
//! accumulate scan counters: at the resolve threshold their `replanned`
//! dependencies are substituted by the children that replaced them, at
//! the skip threshold the item is skipped so the stream never stalls.
//!
//! Cancellation and pause are honoured at every stage boundary; no stage
//! is abandoned mid-call.

use std::sync::Arc;

use td_domain::cancel::CancelToken;
use td_domain::config::Mode;
use td_domain::error::{Error, Result};
use td_domain::event::{EventPayload, StageId, TerminalOutcome, ToolPhase};
use td_domain::todo::{Item, ItemId, ItemStatus, Todo};
use td_domain::tool::ToolCall;

use crate::sessions::SessionHandle;
use crate::stages::{AdjustEdit, ApprovalGate, StageContext, StageOutput};
use crate::state::AppState;

pub struct Executor {
    state: AppState,
}

impl Executor {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run the full workflow for one user message. Emits every event the
    /// client sees, including the terminal.
    pub async fn run(&self, session_id: &str, user_message: &str) {
        let Some(handle) = self.state.sessions.get(session_id) else {
            tracing::warn!(session_id = %session_id, "run for unknown session");
            return;
        };

        let cancel = {
            let mut data = handle.data.lock();
            data.running = true;
            data.cancel = CancelToken::new();
            data.todo = None;
            data.cancel.clone()
        };

        let result = self.run_inner(session_id, &handle, user_message, &cancel).await;

        handle.data.lock().running = false;
        // A cancelled run may leave an approval hanging.
        self.state.approvals.deny_pending(session_id);

        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                tracing::info!(session_id = %session_id, "workflow cancelled");
                self.emit(
                    session_id,
                    StageId::Summary,
                    EventPayload::Terminal {
                        outcome: TerminalOutcome::Cancelled,
                        message: None,
                        error_kind: Some("cancelled".into()),
                    },
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "workflow failed");
                self.emit(
                    session_id,
                    StageId::Summary,
                    EventPayload::Terminal {
                        outcome: TerminalOutcome::Failed,
                        message: Some(e.to_string()),
                        error_kind: Some(e.kind().into()),
                    },
                )
                .await;
            }
        }
    }

    async fn run_inner(
        &self,
        session_id: &str,
        handle: &Arc<SessionHandle>,
        user_message: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        // ── Stage 0: mode routing ───────────────────────────────────
        self.boundary(handle, cancel).await?;
        self.emit(session_id, StageId::Mode, EventPayload::StageTransition { stage: StageId::Mode })
            .await;

        let gate = NoApproval;
        let ctx = self.ctx(session_id, user_message, Mode::Task, cancel, None, None, &gate);
        let StageOutput::Mode { mode, confidence, reply } =
            self.state.stages.mode.process(&ctx).await?
        else {
            return Err(Error::Internal("mode stage returned a foreign output".into()));
        };
        drop(ctx);

        handle.data.lock().mode = mode;
        tracing::info!(session_id = %session_id, %mode, confidence, "mode selected");

        if mode == Mode::Chat {
            self.emit(
                session_id,
                StageId::Mode,
                EventPayload::Chat { text: reply.unwrap_or_default() },
            )
            .await;
            self.emit(
                session_id,
                StageId::Mode,
                EventPayload::Terminal {
                    outcome: TerminalOutcome::Completed,
                    message: None,
                    error_kind: None,
                },
            )
            .await;
            return Ok(());
        }

        // ── Stage 1: planning ───────────────────────────────────────
        self.boundary(handle, cancel).await?;
        self.emit(session_id, StageId::Plan, EventPayload::StageTransition { stage: StageId::Plan })
            .await;

        let ctx = self.ctx(session_id, user_message, mode, cancel, None, None, &gate);
        let StageOutput::Plan { todo } = self.state.stages.plan.process(&ctx).await? else {
            return Err(Error::Internal("plan stage returned a foreign output".into()));
        };
        drop(ctx);

        let mut todo = todo;
        self.sync_todo(handle, &todo);
        self.emit(
            session_id,
            StageId::Plan,
            EventPayload::Progress {
                item_id: None,
                status: None,
                message: format!("plan created with {} steps", todo.items.len()),
                todo: Some(todo.views()),
            },
        )
        .await;

        // ── Per-item loop ───────────────────────────────────────────
        let resolve_at = self.state.config.executor.blocked_check_threshold_resolve;
        let skip_at = self.state.config.executor.blocked_check_threshold_skip;

        'outer: loop {
            self.boundary(handle, cancel).await?;

            let pending: Vec<ItemId> = todo
                .items
                .iter()
                .filter(|i| i.status == ItemStatus::Pending)
                .map(|i| i.id.clone())
                .collect();
            if pending.is_empty() {
                break;
            }

            let mut next: Option<ItemId> = None;
            for id in &pending {
                let item = todo.get(id).expect("pending id exists");
                if todo.unresolved_deps(item).is_empty() {
                    next = Some(id.clone());
                    break;
                }

                // Blocked bookkeeping.
                let count = {
                    let item = todo.get_mut(id).expect("pending id exists");
                    item.blocked_check_count += 1;
                    item.blocked_check_count
                };

                if count == resolve_at {
                    if self.substitute_replanned_deps(&mut todo, id)? {
                        todo.get_mut(id).expect("pending id exists").blocked_check_count = 0;
                        self.sync_todo(handle, &todo);
                        self.emit(
                            session_id,
                            StageId::Execute,
                            EventPayload::Progress {
                                item_id: Some(id.clone()),
                                status: None,
                                message: "blocked dependencies rewritten to replacement steps".into(),
                                todo: Some(todo.views()),
                            },
                        )
                        .await;
                        let item = todo.get(id).expect("pending id exists");
                        if todo.unresolved_deps(item).is_empty() {
                            next = Some(id.clone());
                            break;
                        }
                    }
                } else if count >= skip_at {
                    todo.get_mut(id).expect("pending id exists").status = ItemStatus::Skipped;
                    self.sync_todo(handle, &todo);
                    self.emit(
                        session_id,
                        StageId::Execute,
                        EventPayload::Progress {
                            item_id: Some(id.clone()),
                            status: Some(ItemStatus::Skipped),
                            message: "skipped: dependencies never completed".into(),
                            todo: Some(todo.views()),
                        },
                    )
                    .await;
                    continue 'outer;
                }
            }

            let Some(item_id) = next else {
                // Nothing executable this scan; the counters above
                // guarantee forward progress toward skip.
                tokio::task::yield_now().await;
                continue;
            };

            self.run_item(session_id, handle, user_message, cancel, &mut todo, &item_id)
                .await?;
            self.sync_todo(handle, &todo);
        }

        // ── Stage 8: summary ────────────────────────────────────────
        self.boundary(handle, cancel).await?;
        self.emit(
            session_id,
            StageId::Summary,
            EventPayload::StageTransition { stage: StageId::Summary },
        )
        .await;

        let mode = handle.data.lock().mode;
        let ctx = self.ctx(session_id, user_message, mode, cancel, Some(&todo), None, &gate);
        let summary = match self.state.stages.summary.process(&ctx).await? {
            StageOutput::Summary { text } => text,
            _ => return Err(Error::Internal("summary stage returned a foreign output".into())),
        };
        drop(ctx);

        self.state
            .speech
            .say(&self.state.coordinator, session_id, StageId::Summary, "Workflow complete")
            .await;
        self.emit(session_id, StageId::Summary, EventPayload::Chat { text: summary }).await;
        self.emit(
            session_id,
            StageId::Summary,
            EventPayload::Terminal {
                outcome: TerminalOutcome::Completed,
                message: None,
                error_kind: None,
            },
        )
        .await;
        Ok(())
    }

    // ── One item through stages 2–5 ─────────────────────────────────

    async fn run_item(
        &self,
        session_id: &str,
        handle: &Arc<SessionHandle>,
        user_message: &str,
        cancel: &CancelToken,
        todo: &mut Todo,
        item_id: &ItemId,
    ) -> Result<()> {
        let mode = handle.data.lock().mode;
        let gate = ExecutorApprovalGate {
            state: self.state.clone(),
            item_id: item_id.clone(),
            cancel: cancel.clone(),
        };

        // ── Planning ────────────────────────────────────────────────
        self.boundary(handle, cancel).await?;
        self.set_status(session_id, handle, todo, item_id, ItemStatus::Planning, "planning")
            .await;

        if todo.get(item_id).expect("item exists").selected_providers.is_empty() {
            self.emit(
                session_id,
                StageId::Select,
                EventPayload::StageTransition { stage: StageId::Select },
            )
            .await;
            let snapshot = todo.get(item_id).expect("item exists").clone();
            let ctx = self.ctx(session_id, user_message, mode, cancel, Some(todo), Some(&snapshot), &gate);
            let providers = match self.state.stages.select.process(&ctx).await? {
                StageOutput::Selection { providers } => providers,
                _ => return Err(Error::Internal("select stage returned a foreign output".into())),
            };
            drop(ctx);

            if providers.is_empty() {
                tracing::warn!(item = %item_id, "no capability provider available");
                return self.adjust_or_replan(session_id, handle, user_message, cancel, todo, item_id).await;
            }
            todo.get_mut(item_id).expect("item exists").selected_providers = providers;
        }

        self.emit(
            session_id,
            StageId::ToolPlan,
            EventPayload::StageTransition { stage: StageId::ToolPlan },
        )
        .await;
        let snapshot = todo.get(item_id).expect("item exists").clone();
        let ctx = self.ctx(session_id, user_message, mode, cancel, Some(todo), Some(&snapshot), &gate);
        let planned = self.state.stages.tool_plan.process(&ctx).await;
        drop(ctx);
        match planned {
            Ok(StageOutput::ToolPlan { calls, warnings }) => {
                for warning in warnings {
                    tracing::debug!(item = %item_id, warning = %warning, "tool plan warning");
                }
                todo.get_mut(item_id).expect("item exists").tool_calls = calls;
            }
            Ok(_) => return Err(Error::Internal("tool plan stage returned a foreign output".into())),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                tracing::info!(item = %item_id, error = %e, "tool planning failed");
                return self.adjust_or_replan(session_id, handle, user_message, cancel, todo, item_id).await;
            }
        }

        // ── Execution ───────────────────────────────────────────────
        self.boundary(handle, cancel).await?;
        {
            let item = todo.get(item_id).expect("item exists");
            let spoken = item.action_user.clone().unwrap_or_else(|| item.action.clone());
            self.state
                .speech
                .say(
                    &self.state.coordinator,
                    session_id,
                    StageId::Execute,
                    &format!("Executing: {spoken}"),
                )
                .await;
        }
        self.set_status(session_id, handle, todo, item_id, ItemStatus::Executing, "executing")
            .await;
        self.emit(
            session_id,
            StageId::Execute,
            EventPayload::StageTransition { stage: StageId::Execute },
        )
        .await;

        let snapshot = todo.get(item_id).expect("item exists").clone();
        let ctx = self.ctx(session_id, user_message, mode, cancel, Some(todo), Some(&snapshot), &gate);
        let executed = self.state.stages.execute.process(&ctx).await;
        drop(ctx);
        match executed {
            Ok(StageOutput::Execution { records }) => {
                self.emit_tool_events(session_id, item_id, &records).await;
                todo.get_mut(item_id).expect("item exists").execution_results = records;
            }
            Ok(_) => return Err(Error::Internal("execute stage returned a foreign output".into())),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(Error::Denied(reason)) => {
                tracing::info!(item = %item_id, reason = %reason, "execution denied");
                self.set_status(session_id, handle, todo, item_id, ItemStatus::Failed, &format!("denied: {reason}"))
                    .await;
                return Ok(());
            }
            Err(e) => {
                tracing::info!(item = %item_id, error = %e, "execution failed");
                return self.adjust_or_replan(session_id, handle, user_message, cancel, todo, item_id).await;
            }
        }

        // ── Verification ────────────────────────────────────────────
        self.boundary(handle, cancel).await?;
        self.set_status(session_id, handle, todo, item_id, ItemStatus::Verifying, "verifying")
            .await;
        self.emit(
            session_id,
            StageId::Verify,
            EventPayload::StageTransition { stage: StageId::Verify },
        )
        .await;

        let snapshot = todo.get(item_id).expect("item exists").clone();
        let ctx = self.ctx(session_id, user_message, mode, cancel, Some(todo), Some(&snapshot), &gate);
        let verdict = self.state.stages.verify.process(&ctx).await;
        drop(ctx);
        match verdict {
            Ok(StageOutput::Verdict { accepted, verification }) => {
                let override_applied = verification.override_applied;
                todo.get_mut(item_id).expect("item exists").verification = Some(verification);
                if accepted {
                    let message = if override_applied {
                        "verified (override applied)"
                    } else {
                        "verified"
                    };
                    self.set_status(session_id, handle, todo, item_id, ItemStatus::Completed, message)
                        .await;
                    self.state
                        .speech
                        .say(&self.state.coordinator, session_id, StageId::Verify, "Verified")
                        .await;
                    return Ok(());
                }
                tracing::info!(item = %item_id, "verification rejected");
                self.adjust_or_replan(session_id, handle, user_message, cancel, todo, item_id).await
            }
            Ok(_) => Err(Error::Internal("verify stage returned a foreign output".into())),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                tracing::info!(item = %item_id, error = %e, "verification errored");
                self.adjust_or_replan(session_id, handle, user_message, cancel, todo, item_id).await
            }
        }
    }

    // ── Adjust / replan ladder ──────────────────────────────────────

    async fn adjust_or_replan(
        &self,
        session_id: &str,
        handle: &Arc<SessionHandle>,
        user_message: &str,
        cancel: &CancelToken,
        todo: &mut Todo,
        item_id: &ItemId,
    ) -> Result<()> {
        let mode = handle.data.lock().mode;
        let gate = NoApproval;
        let (attempts, replans) = {
            let item = todo.get(item_id).expect("item exists");
            (item.attempt_count, item.replan_count)
        };
        let max_attempts = self.state.config.executor.max_item_attempts;
        let max_replans = self.state.config.executor.max_replans;

        if attempts < max_attempts && replans == 0 {
            self.emit(
                session_id,
                StageId::Adjust,
                EventPayload::StageTransition { stage: StageId::Adjust },
            )
            .await;
            self.state
                .speech
                .say(&self.state.coordinator, session_id, StageId::Adjust, "Adjusting")
                .await;

            let snapshot = todo.get(item_id).expect("item exists").clone();
            let ctx = self.ctx(session_id, user_message, mode, cancel, Some(todo), Some(&snapshot), &gate);
            let adjusted = self.state.stages.adjust.process(&ctx).await;
            drop(ctx);
            match adjusted {
                Ok(StageOutput::Adjustment { edit }) => {
                    match self.apply_adjustment(todo, item_id, edit) {
                        Ok(()) => {
                            let item = todo.get_mut(item_id).expect("item exists");
                            item.attempt_count += 1;
                            item.status = ItemStatus::Pending;
                            item.tool_calls.clear();
                            item.execution_results.clear();
                            self.sync_todo(handle, todo);
                            self.emit(
                                session_id,
                                StageId::Adjust,
                                EventPayload::Progress {
                                    item_id: Some(item_id.clone()),
                                    status: Some(ItemStatus::Pending),
                                    message: "step adjusted, retrying".into(),
                                    todo: Some(todo.views()),
                                },
                            )
                            .await;
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::info!(item = %item_id, error = %e, "adjustment unusable, replanning");
                        }
                    }
                }
                Ok(_) => return Err(Error::Internal("adjust stage returned a foreign output".into())),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::info!(item = %item_id, error = %e, "adjust failed, replanning");
                }
            }
        }

        if replans < max_replans {
            self.emit(
                session_id,
                StageId::Replan,
                EventPayload::StageTransition { stage: StageId::Replan },
            )
            .await;
            self.state
                .speech
                .say(&self.state.coordinator, session_id, StageId::Replan, "Re-planning this step")
                .await;

            let snapshot = todo.get(item_id).expect("item exists").clone();
            let ctx = self.ctx(session_id, user_message, mode, cancel, Some(todo), Some(&snapshot), &gate);
            let replanned = self.state.stages.replan.process(&ctx).await;
            drop(ctx);
            match replanned {
                Ok(StageOutput::Replan { children }) => {
                    match todo.insert_children(item_id, children) {
                        Ok(child_ids) => {
                            let chain_replans = replans + 1;
                            {
                                let item = todo.get_mut(item_id).expect("item exists");
                                item.replan_count = chain_replans;
                                item.status = ItemStatus::Replanned;
                            }
                            // The replan budget is per chain: children
                            // inherit the count.
                            for child_id in &child_ids {
                                todo.get_mut(child_id).expect("child exists").replan_count =
                                    chain_replans;
                            }
                            self.sync_todo(handle, todo);
                            self.emit(
                                session_id,
                                StageId::Replan,
                                EventPayload::Progress {
                                    item_id: Some(item_id.clone()),
                                    status: Some(ItemStatus::Replanned),
                                    message: format!("replaced by {} new steps", child_ids.len()),
                                    todo: Some(todo.views()),
                                },
                            )
                            .await;
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::warn!(item = %item_id, error = %e, "replan children rejected");
                        }
                    }
                }
                Ok(_) => return Err(Error::Internal("replan stage returned a foreign output".into())),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::info!(item = %item_id, error = %e, "replan failed");
                }
            }
        }

        self.set_status(session_id, handle, todo, item_id, ItemStatus::Failed, "budget exhausted")
            .await;
        Ok(())
    }

    fn apply_adjustment(&self, todo: &mut Todo, item_id: &ItemId, edit: AdjustEdit) -> Result<()> {
        match edit {
            AdjustEdit::Modify { action, success_criteria } => {
                let item = todo.get_mut(item_id).expect("item exists");
                if let Some(action) = action {
                    item.action = action;
                }
                if let Some(criteria) = success_criteria {
                    item.success_criteria = criteria;
                }
                Ok(())
            }
            AdjustEdit::InsertChildren { children } => {
                todo.insert_children(item_id, children).map(|_| ())
            }
        }
    }

    /// Substitute every `replanned` dependency of `item_id` with that
    /// dependency's direct children. Comparison is by insertion order,
    /// never by numeric id.
    fn substitute_replanned_deps(&self, todo: &mut Todo, item_id: &ItemId) -> Result<bool> {
        let deps = todo.get(item_id).expect("item exists").dependencies.clone();
        let mut substituted = false;
        for dep in deps {
            let replanned = todo
                .get(&dep)
                .map(|d| d.status == ItemStatus::Replanned)
                .unwrap_or(false);
            if replanned {
                substituted |= todo.substitute_dependency(item_id, &dep)?;
            }
        }
        Ok(substituted)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn ctx<'a>(
        &'a self,
        session_id: &'a str,
        user_message: &'a str,
        mode: Mode,
        cancel: &'a CancelToken,
        todo: Option<&'a Todo>,
        item: Option<&'a Item>,
        approval: &'a dyn ApprovalGate,
    ) -> StageContext<'a> {
        StageContext {
            session_id,
            user_message,
            mode,
            cancel,
            todo,
            item,
            config: &self.state.config,
            gateway: &self.state.gateway,
            providers: &self.state.providers,
            pipeline: &self.state.pipeline,
            history: &self.state.history,
            inspector: &self.state.inspector,
            approval,
        }
    }

    async fn boundary(&self, handle: &Arc<SessionHandle>, cancel: &CancelToken) -> Result<()> {
        handle.pause.wait_while_paused(cancel).await
    }

    async fn emit(&self, session_id: &str, stage: StageId, payload: EventPayload) {
        self.state.coordinator.emit(session_id, stage, payload).await;
    }

    async fn set_status(
        &self,
        session_id: &str,
        handle: &Arc<SessionHandle>,
        todo: &mut Todo,
        item_id: &ItemId,
        status: ItemStatus,
        message: &str,
    ) {
        todo.get_mut(item_id).expect("item exists").status = status;
        self.sync_todo(handle, todo);
        let stage = match status {
            ItemStatus::Planning => StageId::Select,
            ItemStatus::Executing => StageId::Execute,
            _ => StageId::Verify,
        };
        self.emit(
            session_id,
            stage,
            EventPayload::Progress {
                item_id: Some(item_id.clone()),
                status: Some(status),
                message: message.into(),
                todo: None,
            },
        )
        .await;
    }

    async fn emit_tool_events(
        &self,
        session_id: &str,
        item_id: &ItemId,
        records: &[td_domain::tool::ExecutionRecord],
    ) {
        for record in records {
            self.emit(
                session_id,
                StageId::Execute,
                EventPayload::Tool {
                    item_id: item_id.clone(),
                    tool: record.call.tool.clone(),
                    phase: ToolPhase::Finished,
                    is_error: record.is_error,
                    detail: None,
                },
            )
            .await;
        }
    }

    fn sync_todo(&self, handle: &Arc<SessionHandle>, todo: &Todo) {
        handle.data.lock().todo = Some(todo.clone());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval gates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Placeholder for stages that never dispatch tools.
struct NoApproval;

#[async_trait::async_trait]
impl ApprovalGate for NoApproval {
    async fn request(&self, _session_id: &str, _reason: &str, _calls: &[ToolCall]) -> bool {
        false
    }
}

/// Emits `approval_required` to the client and parks on the approval
/// store until confirm, timeout, or cancel.
struct ExecutorApprovalGate {
    state: AppState,
    item_id: ItemId,
    cancel: CancelToken,
}

#[async_trait::async_trait]
impl ApprovalGate for ExecutorApprovalGate {
    async fn request(&self, session_id: &str, reason: &str, calls: &[ToolCall]) -> bool {
        self.state
            .coordinator
            .emit(
                session_id,
                StageId::Execute,
                EventPayload::Tool {
                    item_id: self.item_id.clone(),
                    tool: calls.first().map(|c| c.tool.clone()).unwrap_or_default(),
                    phase: ToolPhase::ApprovalRequired,
                    is_error: false,
                    detail: Some(reason.to_string()),
                },
            )
            .await;

        let (_info, approved) = self
            .state
            .approvals
            .wait_for_decision(session_id, reason, calls, &self.cancel)
            .await;
        approved
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use td_domain::event::Event;
    use td_llm::{CompletionRequest, LlmClient};

    use crate::testutil::{fast_config, filesystem_tools, test_state, FakeTransport, RouterClient};

    fn session_events(state: &AppState, session_id: &str) -> Vec<Event> {
        state
            .sessions
            .get(session_id)
            .unwrap()
            .data
            .lock()
            .events
            .clone()
    }

    fn assert_contiguous(events: &[Event]) {
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1, "sequence gap at index {i}");
        }
    }

    fn final_todo(state: &AppState, session_id: &str) -> Todo {
        state
            .sessions
            .get(session_id)
            .unwrap()
            .data
            .lock()
            .todo
            .clone()
            .expect("todo present")
    }

    fn status_of(todo: &Todo, id: &str) -> ItemStatus {
        todo.get(&ItemId::from(id)).unwrap().status
    }

    fn text_reply(content: Value) -> Value {
        serde_json::json!({ "content": [{ "type": "text", "text": content }] })
    }

    use serde_json::Value;

    // ── Scenario: trivial chat ──────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn trivial_chat_short_circuits() {
        let client = RouterClient::new()
            .on("Classify the user message", r#"{"mode": "chat", "confidence": 0.95}"#)
            .on("You are a helpful assistant", "Hello! How can I help?");
        let state = test_state(fast_config(), Arc::new(client), vec![]).await;
        state.sessions.resolve_or_create(Some("s1"));

        Executor::new(state.clone()).run("s1", "Hello").await;

        let events = session_events(&state, "s1");
        assert_contiguous(&events);

        let chats: Vec<&Event> = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::Chat { .. }))
            .collect();
        assert_eq!(chats.len(), 1, "exactly one chat message");
        assert!(matches!(
            &chats[0].payload,
            EventPayload::Chat { text } if text == "Hello! How can I help?"
        ));

        let last = events.last().unwrap();
        assert!(matches!(
            last.payload,
            EventPayload::Terminal { outcome: TerminalOutcome::Completed, .. }
        ));

        // No capability provider involved.
        assert!(state.providers.health().is_empty());
        assert!(state.history.is_empty());
    }

    // ── Scenario: two-item task, no retries ─────────────────────────

    fn two_item_client() -> RouterClient {
        RouterClient::new()
            .on("Classify the user message", r#"{"mode": "task", "confidence": 0.92}"#)
            .on(
                "Break the user request",
                r#"{"items": [
                    {"id": "1", "action": "Read /tmp/x", "success_criteria": "contents returned"},
                    {"id": "2", "action": "Write 'ok' to /tmp/y",
                     "success_criteria": "file written", "dependencies": ["1"]}
                ]}"#,
            )
            .on("Choose the capability providers", r#"{"providers": ["filesystem"]}"#)
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__read_file",
                    "parameters": {"path": "/tmp/x"}, "reasoning": "read it"}]}"#,
            )
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__write_file",
                    "parameters": {"path": "/tmp/y", "content": "ok"}, "reasoning": "write it"}]}"#,
            )
            .on("Should this step be verified", r#"{"mode": "data", "confidence": 0.9}"#)
            .on(
                "Judge whether this step succeeded",
                r#"{"verified": true, "confidence": 90, "reasoning": "output matches the criteria"}"#,
            )
            .on("Summarize the outcome", "Both steps completed.")
    }

    #[tokio::test(start_paused = true)]
    async fn two_item_task_completes_in_order() {
        let transport = FakeTransport::healthy(filesystem_tools())
            .script("tools/call", text_reply(serde_json::json!("contents of /tmp/x")))
            .script("tools/call", text_reply(serde_json::json!("written")));
        let state = test_state(
            fast_config(),
            Arc::new(two_item_client()),
            vec![("filesystem", transport)],
        )
        .await;
        state.sessions.resolve_or_create(Some("s1"));

        Executor::new(state.clone()).run("s1", "Read /tmp/x and write 'ok' to /tmp/y").await;

        let todo = final_todo(&state, "s1");
        assert_eq!(status_of(&todo, "1"), ItemStatus::Completed);
        assert_eq!(status_of(&todo, "2"), ItemStatus::Completed);
        assert_eq!(todo.get(&ItemId::from("1")).unwrap().attempt_count, 0);

        // Item 1's read dispatched before item 2's write.
        let item1 = todo.get(&ItemId::from("1")).unwrap();
        assert_eq!(item1.execution_results[0].output, "contents of /tmp/x");
        let item2 = todo.get(&ItemId::from("2")).unwrap();
        assert_eq!(item2.execution_results[0].output, "written");

        let events = session_events(&state, "s1");
        assert_contiguous(&events);

        // Stage transitions arrive in workflow order.
        let stages: Vec<StageId> = events
            .iter()
            .filter_map(|e| match e.payload {
                EventPayload::StageTransition { stage } => Some(stage),
                _ => None,
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                StageId::Mode,
                StageId::Plan,
                StageId::Select,
                StageId::ToolPlan,
                StageId::Execute,
                StageId::Verify,
                StageId::Select,
                StageId::ToolPlan,
                StageId::Execute,
                StageId::Verify,
                StageId::Summary,
            ]
        );

        // Both items verified, then summary chat, then terminal.
        let verified: Vec<&Event> = events
            .iter()
            .filter(|e| {
                matches!(
                    e.payload,
                    EventPayload::Progress { status: Some(ItemStatus::Completed), .. }
                )
            })
            .collect();
        assert_eq!(verified.len(), 2);
        assert!(matches!(
            events.last().unwrap().payload,
            EventPayload::Terminal { outcome: TerminalOutcome::Completed, .. }
        ));

        // Both calls recorded in the bounded history.
        assert_eq!(state.history.len(), 2);
    }

    // ── Scenario: replan on failure + dependency substitution ───────

    fn replan_client() -> RouterClient {
        RouterClient::new()
            .on("Classify the user message", r#"{"mode": "task", "confidence": 0.9}"#)
            .on(
                "Break the user request",
                r#"{"items": [
                    {"id": "1", "action": "Produce the report", "success_criteria": "report exists"},
                    {"id": "2", "action": "Archive the report",
                     "success_criteria": "archive exists", "dependencies": ["1"]}
                ]}"#,
            )
            .on("Choose the capability providers", r#"{"providers": ["filesystem"]}"#)
            // One tool plan per planning pass: item 1, item 1 after
            // adjust, children 1.1 and 1.2, then item 2.
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__read_file",
                    "parameters": {"path": "/tmp/report-a"}}]}"#,
            )
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__read_file",
                    "parameters": {"path": "/tmp/report-b"}}]}"#,
            )
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__write_file",
                    "parameters": {"path": "/tmp/report-part1", "content": "part 1"}}]}"#,
            )
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__write_file",
                    "parameters": {"path": "/tmp/report-part2", "content": "part 2"}}]}"#,
            )
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__write_file",
                    "parameters": {"path": "/tmp/archive", "content": "archived"}}]}"#,
            )
            .on("Should this step be verified", r#"{"mode": "data", "confidence": 0.9}"#)
            // Item 1 fails twice, everything afterwards verifies.
            .on(
                "Judge whether this step succeeded",
                r#"{"verified": false, "confidence": 95, "reasoning": "the report is missing"}"#,
            )
            .on(
                "Judge whether this step succeeded",
                r#"{"verified": false, "confidence": 95, "reasoning": "still missing"}"#,
            )
            .on(
                "Judge whether this step succeeded",
                r#"{"verified": true, "confidence": 90, "reasoning": "output matches"}"#,
            )
            .on(
                "MINIMAL adjustment",
                r#"{"modify": {"action": "Produce the report from the raw data"}}"#,
            )
            .on(
                "fresh approach",
                r#"{"children": [
                    {"action": "Write part one of the report", "success_criteria": "part one exists"},
                    {"action": "Write part two of the report", "success_criteria": "part two exists",
                     "depends_on": [1]}
                ]}"#,
            )
            .on("Summarize the outcome", "Recovered by splitting the work.")
    }

    #[tokio::test(start_paused = true)]
    async fn replan_inserts_children_and_substitution_unblocks_dependents() {
        let mut config = fast_config();
        config.executor.max_item_attempts = 1;
        let transport = FakeTransport::healthy(filesystem_tools())
            .script("tools/call", text_reply(serde_json::json!("done")));
        let state = test_state(config, Arc::new(replan_client()), vec![("filesystem", transport)])
            .await;
        state.sessions.resolve_or_create(Some("s1"));

        Executor::new(state.clone()).run("s1", "Produce and archive the report").await;

        let todo = final_todo(&state, "s1");
        assert_eq!(status_of(&todo, "1"), ItemStatus::Replanned);
        assert_eq!(status_of(&todo, "1.1"), ItemStatus::Completed);
        assert_eq!(status_of(&todo, "1.2"), ItemStatus::Completed);
        assert_eq!(status_of(&todo, "2"), ItemStatus::Completed);

        // The adjust pass ran before the replan.
        let item1 = todo.get(&ItemId::from("1")).unwrap();
        assert_eq!(item1.attempt_count, 1);
        assert_eq!(item1.replan_count, 1);
        assert!(item1.action.contains("raw data"));

        // Children inherit the chain's replan budget and sibling deps.
        let child2 = todo.get(&ItemId::from("1.2")).unwrap();
        assert_eq!(child2.replan_count, 1);
        assert_eq!(child2.dependencies, vec![ItemId::from("1.1")]);

        // Item 2's dependency on the replanned parent was substituted by
        // insertion-order comparison, then satisfied.
        let item2 = todo.get(&ItemId::from("2")).unwrap();
        assert_eq!(item2.dependencies, vec![ItemId::from("1.1"), ItemId::from("1.2")]);
        assert_eq!(item2.blocked_check_count, 0);

        assert_contiguous(&session_events(&state, "s1"));
    }

    // ── Scenario: infinite-loop protection ──────────────────────────

    fn doomed_client() -> RouterClient {
        RouterClient::new()
            .on("Classify the user message", r#"{"mode": "task", "confidence": 0.9}"#)
            .on(
                "Break the user request",
                r#"{"items": [
                    {"id": "1", "action": "Do the impossible", "success_criteria": "it works"},
                    {"id": "2", "action": "Celebrate", "success_criteria": "party held",
                     "dependencies": ["1"]}
                ]}"#,
            )
            .on("Choose the capability providers", r#"{"providers": ["filesystem"]}"#)
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__read_file",
                    "parameters": {"path": "/tmp/impossible-1"}}]}"#,
            )
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__read_file",
                    "parameters": {"path": "/tmp/impossible-2"}}]}"#,
            )
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__read_file",
                    "parameters": {"path": "/tmp/impossible-3"}}]}"#,
            )
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__read_file",
                    "parameters": {"path": "/tmp/impossible-4"}}]}"#,
            )
            .on("Should this step be verified", r#"{"mode": "data", "confidence": 0.9}"#)
            .on(
                "Judge whether this step succeeded",
                r#"{"verified": false, "confidence": 95, "reasoning": "it did not work"}"#,
            )
            .on("MINIMAL adjustment", r#"{"modify": {"action": "Try the impossible differently"}}"#)
            .on(
                "fresh approach",
                r#"{"children": [{"action": "Attempt an alternate route",
                    "success_criteria": "route works"}]}"#,
            )
            .on("Summarize the outcome", "The goal could not be achieved.")
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budgets_skip_dependents_without_stalling() {
        let mut config = fast_config();
        config.executor.max_item_attempts = 1;
        config.executor.max_replans = 1;
        let transport = FakeTransport::healthy(filesystem_tools())
            .script("tools/call", text_reply(serde_json::json!("nothing")));
        let state = test_state(config, Arc::new(doomed_client()), vec![("filesystem", transport)])
            .await;
        state.sessions.resolve_or_create(Some("s1"));

        Executor::new(state.clone()).run("s1", "Do the impossible, then celebrate").await;

        let todo = final_todo(&state, "s1");
        assert_eq!(status_of(&todo, "1"), ItemStatus::Replanned);
        // The replacement child inherits an exhausted replan budget and
        // fails without further replanning.
        assert_eq!(status_of(&todo, "1.1"), ItemStatus::Failed);
        // The dependent exhausts its blocked scans and is skipped.
        assert_eq!(status_of(&todo, "2"), ItemStatus::Skipped);

        let events = session_events(&state, "s1");
        assert_contiguous(&events);
        assert!(events.iter().any(|e| matches!(
            e.payload,
            EventPayload::Progress { status: Some(ItemStatus::Skipped), .. }
        )));
        // The stream still terminates.
        assert!(matches!(
            events.last().unwrap().payload,
            EventPayload::Terminal { outcome: TerminalOutcome::Completed, .. }
        ));
    }

    // ── Scenario: verification false-but-matches override ───────────

    #[tokio::test(start_paused = true)]
    async fn low_confidence_false_with_match_keyword_completes() {
        let client = RouterClient::new()
            .on("Classify the user message", r#"{"mode": "task", "confidence": 0.9}"#)
            .on(
                "Break the user request",
                r#"{"items": [{"id": "1", "action": "Update the page",
                    "success_criteria": "page shows the new value"}]}"#,
            )
            .on("Choose the capability providers", r#"{"providers": ["filesystem"]}"#)
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "filesystem", "tool": "filesystem__read_file",
                    "parameters": {"path": "/tmp/page"}}]}"#,
            )
            .on("Should this step be verified", r#"{"mode": "data", "confidence": 0.9}"#)
            .on(
                "Judge whether this step succeeded",
                r#"{"verified": false, "confidence": 35,
                    "reasoning": "the rendered page matches the success criteria"}"#,
            )
            .on("Summarize the outcome", "Updated.");
        let transport = FakeTransport::healthy(filesystem_tools())
            .script("tools/call", text_reply(serde_json::json!("new value")));
        let state = test_state(fast_config(), Arc::new(client), vec![("filesystem", transport)])
            .await;
        state.sessions.resolve_or_create(Some("s1"));

        Executor::new(state.clone()).run("s1", "Update the page").await;

        let todo = final_todo(&state, "s1");
        assert_eq!(status_of(&todo, "1"), ItemStatus::Completed);
        let verification = todo.get(&ItemId::from("1")).unwrap().verification.clone().unwrap();
        assert!(verification.override_applied);
        assert!(verification.verified);

        // The observability flag reaches the event stream.
        let events = session_events(&state, "s1");
        assert!(events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::Progress { message, .. } if message.contains("override")
        )));
    }

    // ── Approval gating ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn unanswered_approval_denies_the_item() {
        let client = RouterClient::new()
            .on("Classify the user message", r#"{"mode": "task", "confidence": 0.9}"#)
            .on(
                "Break the user request",
                r#"{"items": [{"id": "1", "action": "Restart the web server",
                    "success_criteria": "server restarted"}]}"#,
            )
            .on("Choose the capability providers", r#"{"providers": ["shell"]}"#)
            .on(
                "Plan the tool calls",
                r#"{"tool_calls": [{"provider": "shell", "tool": "shell__run_command",
                    "parameters": {"command": "sudo systemctl restart nginx"}}]}"#,
            )
            .on("Summarize the outcome", "Nothing was restarted.");
        let transport = FakeTransport::healthy(serde_json::json!([
            { "name": "run_command", "description": "Run a shell command",
              "inputSchema": { "type": "object",
                "properties": { "command": { "type": "string" } }, "required": ["command"] } }
        ]));
        let state = test_state(fast_config(), Arc::new(client), vec![("shell", transport)]).await;
        state.sessions.resolve_or_create(Some("s1"));

        Executor::new(state.clone()).run("s1", "Restart the web server").await;

        let todo = final_todo(&state, "s1");
        assert_eq!(status_of(&todo, "1"), ItemStatus::Failed);

        let events = session_events(&state, "s1");
        assert!(events.iter().any(|e| matches!(
            e.payload,
            EventPayload::Tool { phase: ToolPhase::ApprovalRequired, .. }
        )));
        // The denial is visible in the item's failure message.
        assert!(events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::Progress { status: Some(ItemStatus::Failed), message, .. }
                if message.contains("denied")
        )));
    }

    // ── Cancellation ────────────────────────────────────────────────

    struct CancellingClient {
        inner: RouterClient,
        state: std::sync::OnceLock<AppState>,
    }

    #[async_trait::async_trait]
    impl LlmClient for CancellingClient {
        async fn complete(&self, req: &CompletionRequest) -> td_domain::error::Result<String> {
            let prompt: String = req.messages.iter().map(|m| m.content.clone()).collect();
            if prompt.contains("Break the user request") {
                if let Some(state) = self.state.get() {
                    if let Some(handle) = state.sessions.get("s1") {
                        handle.data.lock().cancel.cancel();
                    }
                }
            }
            self.inner.complete(req).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_planning_emits_cancelled_terminal() {
        let inner = RouterClient::new()
            .on("Classify the user message", r#"{"mode": "task", "confidence": 0.9}"#)
            .on(
                "Break the user request",
                r#"{"items": [{"id": "1", "action": "Anything", "success_criteria": "done"}]}"#,
            );
        let client = Arc::new(CancellingClient {
            inner,
            state: std::sync::OnceLock::new(),
        });
        let state = test_state(fast_config(), client.clone(), vec![]).await;
        client.state.set(state.clone()).ok();
        state.sessions.resolve_or_create(Some("s1"));

        Executor::new(state.clone()).run("s1", "Do a thing").await;

        let events = session_events(&state, "s1");
        assert_contiguous(&events);
        assert!(matches!(
            events.last().unwrap().payload,
            EventPayload::Terminal { outcome: TerminalOutcome::Cancelled, .. }
        ));
        // The session stays usable for a new request.
        assert!(!state.sessions.get("s1").unwrap().data.lock().running);
    }
}
