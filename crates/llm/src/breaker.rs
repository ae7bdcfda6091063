//! Circuit breaker for one LLM service.
//!
//! Opens after `failure_threshold` consecutive failures inside the
//! configured window, stays open for `reset_ms`, then admits a single
//! half-open probe; one success closes it again.

use parking_lot::Mutex;
use tokio::time::Instant;

use td_domain::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; proceed normally.
    Pass,
    /// Circuit half-open; this request is the probe.
    Probe,
    /// Circuit open; reject without calling the service.
    Reject,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask for admission. Transitions open → half-open when the reset
    /// period has elapsed.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Pass,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                if elapsed >= self.config.reset_ms {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Reject
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Open and still inside the reset period: reject without queueing.
    pub fn is_blocking(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == CircuitState::Open
            && inner
                .opened_at
                .map(|t| (t.elapsed().as_millis() as u64) < self.config.reset_ms)
                .unwrap_or(false)
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::warn!("half-open probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                let now = Instant::now();
                // Consecutive failures only count inside the window.
                let in_window = inner
                    .first_failure_at
                    .map(|t| (now - t).as_millis() as u64 <= self.config.window_ms)
                    .unwrap_or(false);
                if in_window {
                    inner.consecutive_failures += 1;
                } else {
                    inner.consecutive_failures = 1;
                    inner.first_failure_at = Some(now);
                }
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
