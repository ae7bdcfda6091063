//! Stage 4 — tool execution.
//!
//! Dispatches the item's validated calls through the inspector and the
//! provider host. Declared-independent calls run concurrently, bounded
//! per provider by the configured `per_provider_concurrency` (default 1
//! — providers are single-threaded stdio processes); dependent plans
//! always run in planned order. Results are always collected in planned
//! order.

use std::collections::HashMap;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use td_domain::error::{Error, Result};
use td_domain::event::StageId;
use td_domain::tool::{ExecutionRecord, ToolCall};
use td_pipeline::history::CallOutcome;
use td_pipeline::inspector::InspectionDecision;
use td_pipeline::params_hash;

use super::{StageContext, StageOutput, StageProcessor};

pub struct ExecuteStage;

#[async_trait::async_trait]
impl StageProcessor for ExecuteStage {
    fn id(&self) -> StageId {
        StageId::Execute
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let item = ctx.require_item()?;
        let calls = &item.tool_calls;
        if calls.is_empty() {
            return Ok(StageOutput::Execution { records: Vec::new() });
        }

        // The inspector sees the final post-correction batch.
        let inspection = ctx.inspector.inspect_batch(ctx.session_id, ctx.mode, calls);
        match inspection.decision {
            InspectionDecision::Deny => {
                return Err(Error::Denied(
                    inspection.reason.unwrap_or_else(|| "inspector denied the batch".into()),
                ));
            }
            InspectionDecision::RequireApproval => {
                let reason = inspection.reason.unwrap_or_else(|| "approval required".into());
                let approved = ctx.approval.request(ctx.session_id, &reason, calls).await;
                if !approved {
                    return Err(Error::Denied(format!("approval not granted: {reason}")));
                }
            }
            InspectionDecision::Allow => {}
        }

        let records = if calls_are_independent(calls) {
            execute_parallel(ctx, calls).await?
        } else {
            execute_sequential(ctx, calls).await?
        };

        Ok(StageOutput::Execution { records })
    }
}

/// Calls are independent when no parameter references another call's
/// output (template markers like `{{result_1}}` or `$output`).
fn calls_are_independent(calls: &[ToolCall]) -> bool {
    calls.iter().all(|call| {
        let mut strings = Vec::new();
        collect_strings(&call.parameters, &mut strings);
        strings
            .iter()
            .all(|s| !s.contains("{{") && !s.contains("$result") && !s.contains("$output"))
    })
}

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Dependent plans run strictly in planned order; a transport failure
/// aborts the rest of the batch.
async fn execute_sequential(
    ctx: &StageContext<'_>,
    calls: &[ToolCall],
) -> Result<Vec<ExecutionRecord>> {
    let mut records = Vec::with_capacity(calls.len());
    for call in calls {
        ctx.cancel.ensure_active()?;
        let (record, fatal) = run_call(ctx, call).await?;
        records.push(record);
        if fatal {
            tracing::warn!(tool = %call.tool, "aborting remaining calls after transport failure");
            break;
        }
    }
    Ok(records)
}

/// Group calls by provider (each group keeps planned order), run groups
/// concurrently with at most `per_provider_concurrency` calls in flight
/// per provider, then stitch results back into planned order.
async fn execute_parallel(
    ctx: &StageContext<'_>,
    calls: &[ToolCall],
) -> Result<Vec<ExecutionRecord>> {
    let limit = ctx.config.executor.per_provider_concurrency.max(1);
    let mut groups: HashMap<&str, Vec<(usize, &ToolCall)>> = HashMap::new();
    for (idx, call) in calls.iter().enumerate() {
        groups.entry(call.provider.as_str()).or_default().push((idx, call));
    }

    let group_futs = groups
        .into_values()
        .map(|group| run_provider_group(ctx, group, limit));

    let mut indexed: Vec<(usize, ExecutionRecord)> = Vec::with_capacity(calls.len());
    for group in futures_util::future::join_all(group_futs).await {
        indexed.extend(group?);
    }
    indexed.sort_by_key(|(idx, _)| *idx);
    Ok(indexed.into_iter().map(|(_, record)| record).collect())
}

/// One provider's calls, gated by a semaphore sized to the concurrency
/// limit. The semaphore is fair, so at limit 1 the group dispatches in
/// planned order. A transport-level failure closes the gate: calls that
/// have not started yet are dropped from the batch.
async fn run_provider_group(
    ctx: &StageContext<'_>,
    group: Vec<(usize, &ToolCall)>,
    limit: usize,
) -> Result<Vec<(usize, ExecutionRecord)>> {
    let gate = Semaphore::new(limit);
    let call_futs = group.into_iter().map(|(idx, call)| {
        let gate = &gate;
        async move {
            let Ok(_permit) = gate.acquire().await else {
                // Gate closed after an earlier transport failure.
                return Ok(None);
            };
            ctx.cancel.ensure_active()?;
            let (record, fatal) = run_call(ctx, call).await?;
            if fatal {
                tracing::warn!(tool = %call.tool, "closing provider gate after transport failure");
                gate.close();
            }
            Ok::<_, Error>(Some((idx, record)))
        }
    });

    let mut results = Vec::new();
    for outcome in futures_util::future::join_all(call_futs).await {
        if let Some(entry) = outcome? {
            results.push(entry);
        }
    }
    Ok(results)
}

/// Dispatch one call. Returns the record plus whether the failure was a
/// transport-level one that should abort the rest of the batch.
/// Cancellation propagates as an error.
async fn run_call(ctx: &StageContext<'_>, call: &ToolCall) -> Result<(ExecutionRecord, bool)> {
    let hash = params_hash(&call.parameters);
    ctx.inspector.record_dispatch(ctx.session_id, call);

    let started = Instant::now();
    let outcome = ctx
        .providers
        .call_tool(&call.tool, call.parameters.clone(), ctx.cancel)
        .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(result) => {
            let is_error = result.is_error;
            ctx.history.record(
                &call.tool,
                &hash,
                if is_error { CallOutcome::Failure } else { CallOutcome::Success },
                duration_ms,
            );
            Ok((
                ExecutionRecord {
                    call: call.clone(),
                    output: result.text(),
                    is_error,
                    stderr: None,
                    duration_ms,
                },
                false,
            ))
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            ctx.history.record(&call.tool, &hash, CallOutcome::Failure, duration_ms);
            let fatal = matches!(e, Error::ProviderTerminated(_) | Error::Timeout(_));
            tracing::warn!(tool = %call.tool, error = %e, "tool call failed");
            Ok((
                ExecutionRecord {
                    call: call.clone(),
                    output: format!("error ({}): {e}", e.kind()),
                    is_error: true,
                    stderr: None,
                    duration_ms,
                },
                fatal,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(provider: &str, tool: &str, params: serde_json::Value) -> ToolCall {
        ToolCall {
            provider: provider.into(),
            tool: tool.into(),
            parameters: params,
            reasoning: String::new(),
        }
    }

    #[test]
    fn template_markers_defeat_independence() {
        let calls = [
            call("filesystem", "filesystem__read_file", serde_json::json!({"path": "/tmp/x"})),
            call(
                "filesystem",
                "filesystem__write_file",
                serde_json::json!({"path": "/tmp/y", "content": "{{result_1}}"}),
            ),
        ];
        assert!(!calls_are_independent(&calls));
    }

    #[test]
    fn plain_calls_are_independent() {
        let calls = [
            call("filesystem", "filesystem__read_file", serde_json::json!({"path": "/tmp/x"})),
            call("shell", "shell__run_command", serde_json::json!({"command": "ls"})),
        ];
        assert!(calls_are_independent(&calls));
    }
}
