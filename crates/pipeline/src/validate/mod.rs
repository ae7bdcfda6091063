//! Five-stage tool-call validation pipeline with early rejection and
//! compounding auto-correction.
//!
//! Stage order is fixed: Format → History → Schema → Provider-Sync →
//! Semantic. Format, Schema, and Provider-Sync are critical (a failure
//! marks the call invalid); History and Semantic only ever warn. When
//! Provider-Sync rewrites the tool name, the Schema stage is re-run on
//! the corrected call so a name fix and a key fix compose.

mod stages;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use td_domain::config::ValidationConfig;
use td_domain::error::{Error, Result};
use td_domain::tool::ToolCall;
use td_provider_host::ToolRegistry;

use crate::history::ToolHistory;
use stages::Outcome;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Report types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Format,
    History,
    Schema,
    ProviderSync,
    Semantic,
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageName::Format => "format",
            StageName::History => "history",
            StageName::Schema => "schema",
            StageName::ProviderSync => "provider_sync",
            StageName::Semantic => "semantic",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Pass,
    Corrected,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    NonCritical,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageName,
    pub outcome: StageOutcome,
    pub severity: Severity,
    pub diagnostics: Vec<String>,
    pub elapsed_ms: u64,
}

/// The pipeline's verdict on one tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// The final call, with every accepted correction applied.
    pub call: ToolCall,
    pub valid: bool,
    pub corrected: bool,
    pub stages: Vec<StageReport>,
}

impl ValidationReport {
    /// Diagnostics from critical-stage failures.
    pub fn failures(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.severity == Severity::Critical && s.outcome == StageOutcome::Fail)
            .flat_map(|s| s.diagnostics.iter().cloned())
            .collect()
    }

    /// Diagnostics from non-critical stages (warnings only).
    pub fn warnings(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.severity == Severity::NonCritical && s.outcome == StageOutcome::Fail)
            .flat_map(|s| s.diagnostics.iter().cloned())
            .collect()
    }

    /// One line per diagnostic, for folding into a retry prompt.
    pub fn diagnostics_text(&self) -> String {
        self.stages
            .iter()
            .flat_map(|s| {
                s.diagnostics
                    .iter()
                    .map(move |d| format!("[{}] {d}", s.stage))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Semantic reviewer seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Second-opinion reviewer for the semantic stage; implemented against
/// the LLM gateway by the orchestrator. Returns a warning, or `None` when
/// the call looks sound.
#[async_trait::async_trait]
pub trait SemanticReviewer: Send + Sync {
    async fn review(&self, call: &ToolCall, action: &str) -> Result<Option<String>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metrics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Clone, Copy)]
struct StageCounters {
    pass: u64,
    fail: u64,
    corrected: u64,
    total_elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageMetrics {
    pub stage: StageName,
    pub pass: u64,
    pub fail: u64,
    pub corrected: u64,
    pub avg_elapsed_ms: f64,
}

#[derive(Default)]
struct PipelineMetrics {
    counters: Mutex<std::collections::HashMap<StageName, StageCounters>>,
}

impl PipelineMetrics {
    fn record(&self, stage: StageName, outcome: StageOutcome, elapsed_ms: u64) {
        let mut counters = self.counters.lock();
        let entry = counters.entry(stage).or_default();
        match outcome {
            StageOutcome::Pass => entry.pass += 1,
            StageOutcome::Fail => entry.fail += 1,
            StageOutcome::Corrected => entry.corrected += 1,
        }
        entry.total_elapsed_ms += elapsed_ms;
    }

    fn snapshot(&self) -> Vec<StageMetrics> {
        let counters = self.counters.lock();
        let mut out: Vec<StageMetrics> = counters
            .iter()
            .map(|(stage, c)| {
                let runs = c.pass + c.fail + c.corrected;
                StageMetrics {
                    stage: *stage,
                    pass: c.pass,
                    fail: c.fail,
                    corrected: c.corrected,
                    avg_elapsed_ms: if runs == 0 {
                        0.0
                    } else {
                        c.total_elapsed_ms as f64 / runs as f64
                    },
                }
            })
            .collect();
        out.sort_by_key(|m| m.stage as u8);
        out
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ValidationPipeline {
    config: ValidationConfig,
    history: Arc<ToolHistory>,
    registry: Arc<ToolRegistry>,
    semantic: Option<Arc<dyn SemanticReviewer>>,
    metrics: PipelineMetrics,
}

impl ValidationPipeline {
    pub fn new(
        config: ValidationConfig,
        history: Arc<ToolHistory>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            history,
            registry,
            semantic: None,
            metrics: PipelineMetrics::default(),
        }
    }

    pub fn with_semantic(mut self, reviewer: Arc<dyn SemanticReviewer>) -> Self {
        self.semantic = Some(reviewer);
        self
    }

    /// Read-only metrics accessor.
    pub fn metrics(&self) -> Vec<StageMetrics> {
        self.metrics.snapshot()
    }

    /// Validate a batch of calls under the aggregate deadline.
    pub async fn validate_batch(
        &self,
        calls: &[ToolCall],
        action: &str,
    ) -> Result<Vec<ValidationReport>> {
        let deadline = Duration::from_millis(self.config.aggregate_timeout_ms);
        let work = async {
            let mut reports = Vec::with_capacity(calls.len());
            for call in calls {
                reports.push(self.validate_call(call, action).await);
            }
            reports
        };
        tokio::time::timeout(deadline, work)
            .await
            .map_err(|_| Error::Timeout("validation".into()))
    }

    /// Run all five stages on one call.
    pub async fn validate_call(&self, call: &ToolCall, action: &str) -> ValidationReport {
        let mut working = call.clone();
        let mut reports: Vec<StageReport> = Vec::with_capacity(5);
        let mut corrected = false;
        let mut valid = true;

        let apply = |result: stages::StageResult,
                         stage: StageName,
                         severity: Severity,
                         elapsed_ms: u64,
                         working: &mut ToolCall,
                         corrected: &mut bool,
                         valid: &mut bool,
                         reports: &mut Vec<StageReport>| {
            let outcome = match result.outcome {
                Outcome::Pass => StageOutcome::Pass,
                Outcome::Corrected => StageOutcome::Corrected,
                Outcome::Fail => StageOutcome::Fail,
            };
            if let Some(fixed) = result.corrected_call {
                *working = fixed;
                *corrected = true;
            }
            if outcome == StageOutcome::Fail && severity == Severity::Critical {
                *valid = false;
            }
            self.metrics.record(stage, outcome, elapsed_ms);
            reports.push(StageReport {
                stage,
                outcome,
                severity,
                diagnostics: result.diagnostics,
                elapsed_ms,
            });
        };

        macro_rules! run {
            ($stage:expr, $severity:expr, $body:expr) => {{
                let started = Instant::now();
                let result = $body;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                apply(
                    result,
                    $stage,
                    $severity,
                    elapsed_ms,
                    &mut working,
                    &mut corrected,
                    &mut valid,
                    &mut reports,
                );
            }};
        }

        // 1. Format (critical).
        run!(StageName::Format, Severity::Critical, stages::format(&working));
        if !valid && self.config.early_rejection {
            return ValidationReport { call: working, valid, corrected, stages: reports };
        }

        // 2. History (warn only).
        run!(
            StageName::History,
            Severity::NonCritical,
            stages::history(&self.history, self.config.history_failure_threshold, &working)
        );

        // 3. Schema (critical).
        run!(
            StageName::Schema,
            Severity::Critical,
            stages::schema(&self.registry, self.config.similarity_threshold, &working)
        );
        if !valid && self.config.early_rejection {
            return ValidationReport { call: working, valid, corrected, stages: reports };
        }

        // 4. Provider-Sync (critical).
        let tool_before_sync = working.tool.clone();
        run!(
            StageName::ProviderSync,
            Severity::Critical,
            stages::provider_sync(&self.registry, self.config.similarity_threshold, &working)
        );
        if !valid && self.config.early_rejection {
            return ValidationReport { call: working, valid, corrected, stages: reports };
        }

        // A rewritten name means the schema stage validated against the
        // wrong (or no) definition; run it again so corrections compose.
        if working.tool != tool_before_sync {
            run!(
                StageName::Schema,
                Severity::Critical,
                stages::schema(&self.registry, self.config.similarity_threshold, &working)
            );
            if !valid && self.config.early_rejection {
                return ValidationReport { call: working, valid, corrected, stages: reports };
            }
        }

        // 5. Semantic (optional, warn only).
        if self.config.semantic_enabled {
            if let Some(reviewer) = &self.semantic {
                let started = Instant::now();
                let result = stages::semantic(reviewer.as_ref(), &working, action).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                apply(
                    result,
                    StageName::Semantic,
                    Severity::NonCritical,
                    elapsed_ms,
                    &mut working,
                    &mut corrected,
                    &mut valid,
                    &mut reports,
                );
            }
        }

        ValidationReport { call: working, valid, corrected, stages: reports }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
