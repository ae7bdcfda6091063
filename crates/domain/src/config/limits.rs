use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM gateway rate limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Adaptive throttle bounds and queue limits for the LLM gateway.
/// Values apply to every service unless overridden per service id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum spacing between requests to one service.
    #[serde(default = "d_250")]
    pub min_delay_ms: u64,
    /// Upper bound the adaptive throttle may back off to.
    #[serde(default = "d_5000")]
    pub max_delay_ms: u64,
    /// Queued requests per service; overflow is rejected `rate-limited`.
    #[serde(default = "d_50")]
    pub queue_cap: usize,
    /// Per-service overrides, keyed by service id.
    #[serde(default)]
    pub services: HashMap<String, RateLimitOverride>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 250,
            max_delay_ms: 5_000,
            queue_cap: 50,
            services: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Effective limits for a service, applying any override.
    pub fn for_service(&self, service: &str) -> (u64, u64, usize) {
        match self.services.get(service) {
            Some(o) => (
                o.min_delay_ms.unwrap_or(self.min_delay_ms),
                o.max_delay_ms.unwrap_or(self.max_delay_ms),
                o.queue_cap.unwrap_or(self.queue_cap),
            ),
            None => (self.min_delay_ms, self.max_delay_ms, self.queue_cap),
        }
    }
}

/// Optional per-service overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimitOverride {
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub queue_cap: Option<usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Circuit breaker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures within the window that open the circuit.
    #[serde(default = "d_3")]
    pub failure_threshold: u32,
    /// Window in which the consecutive failures must occur.
    #[serde(default = "d_60000")]
    pub window_ms: u64,
    /// How long the circuit stays open before a half-open probe.
    #[serde(default = "d_60000")]
    pub reset_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_ms: 60_000,
            reset_ms: 60_000,
        }
    }
}

fn d_3() -> u32 {
    3
}
fn d_50() -> usize {
    50
}
fn d_250() -> u64 {
    250
}
fn d_5000() -> u64 {
    5_000
}
fn d_60000() -> u64 {
    60_000
}
