use serde::{Deserialize, Serialize};

/// TODO executor budgets and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Planning + execution attempts per item before adjust/replan.
    #[serde(default = "d_2")]
    pub max_item_attempts: u32,
    /// Replan budget per item chain.
    #[serde(default = "d_3")]
    pub max_replans: u32,
    /// Blocked-scan count that triggers dependency substitution.
    #[serde(default = "d_5")]
    pub blocked_check_threshold_resolve: u32,
    /// Blocked-scan count that skips the item.
    #[serde(default = "d_10")]
    pub blocked_check_threshold_skip: u32,
    /// Concurrent in-flight tool calls per provider during execution.
    /// Providers are single-threaded stdio processes; 1 is the safe default.
    #[serde(default = "d_1")]
    pub per_provider_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_item_attempts: 2,
            max_replans: 3,
            blocked_check_threshold_resolve: 5,
            blocked_check_threshold_skip: 10,
            per_provider_concurrency: 1,
        }
    }
}

fn d_1() -> usize {
    1
}
fn d_2() -> u32 {
    2
}
fn d_3() -> u32 {
    3
}
fn d_5() -> u32 {
    5
}
fn d_10() -> u32 {
    10
}
