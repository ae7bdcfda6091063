//! Per-service request queues in front of the injected LLM client.
//!
//! Every service gets a dedicated worker that serves its bounded queue
//! priority-then-FIFO, spaced by an adaptive delay (shortened when the
//! backlog grows, lengthened on retryable failures), with identical
//! in-flight request bodies coalesced into a single upstream call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use td_domain::cancel::CancelToken;
use td_domain::config::{CircuitConfig, RateLimitConfig};
use td_domain::error::{Error, Result};

use crate::breaker::{Admission, CircuitBreaker, CircuitState};
use crate::client::{CompletionRequest, LlmClient, Priority};

/// Backlog size past which the throttle delay is shortened.
const BACKLOG_SHORTEN_THRESHOLD: usize = 20;
/// Attempts per request for retryable failures.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(200);
/// How often a waiter re-checks its session's cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(100);

type SharedResult = Arc<Result<String>>;

struct Job {
    hash: String,
    req: CompletionRequest,
    timeout: Duration,
}

#[derive(Default)]
struct Queues {
    critical: VecDeque<Job>,
    normal: VecDeque<Job>,
    /// Single-flight map: body hash of each queued or executing request.
    inflight: HashMap<String, broadcast::Sender<SharedResult>>,
}

impl Queues {
    fn backlog(&self) -> usize {
        self.critical.len() + self.normal.len()
    }
}

struct ServiceState {
    name: String,
    queues: Mutex<Queues>,
    notify: Notify,
    breaker: CircuitBreaker,
    /// Current adaptive spacing between dispatches.
    delay_ms: AtomicU64,
    min_delay_ms: u64,
    max_delay_ms: u64,
    queue_cap: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmGateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmGateway {
    client: Arc<dyn LlmClient>,
    rate: RateLimitConfig,
    circuit: CircuitConfig,
    services: RwLock<HashMap<String, Arc<ServiceState>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LlmGateway {
    pub fn new(client: Arc<dyn LlmClient>, rate: RateLimitConfig, circuit: CircuitConfig) -> Self {
        Self {
            client,
            rate,
            circuit,
            services: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a completion request on the named service and wait for its
    /// result. Identical request bodies already in flight are coalesced.
    pub async fn complete(
        &self,
        service: &str,
        req: CompletionRequest,
        priority: Priority,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<String> {
        cancel.ensure_active()?;
        let state = self.service(service);

        if state.breaker.is_blocking() {
            return Err(Error::RateLimited(format!(
                "circuit open for service '{service}'"
            )));
        }

        let hash = req.body_hash();
        let mut rx = {
            let mut queues = state.queues.lock();
            if let Some(tx) = queues.inflight.get(&hash) {
                tx.subscribe()
            } else {
                if queues.backlog() >= state.queue_cap {
                    return Err(Error::RateLimited(format!(
                        "queue full for service '{service}'"
                    )));
                }
                let (tx, rx) = broadcast::channel(1);
                queues.inflight.insert(hash.clone(), tx);
                let job = Job { hash, req, timeout };
                match priority {
                    Priority::Critical => queues.critical.push_back(job),
                    Priority::Normal => queues.normal.push_back(job),
                }
                rx
            }
        };
        state.notify.notify_one();

        loop {
            tokio::select! {
                res = rx.recv() => {
                    return match res {
                        Ok(shared) => (*shared).clone(),
                        Err(_) => Err(Error::Internal("llm worker dropped its result".into())),
                    };
                }
                _ = tokio::time::sleep(CANCEL_POLL) => cancel.ensure_active()?,
            }
        }
    }

    /// Circuit state per service, sorted by name, for the health endpoint.
    pub fn circuit_status(&self) -> Vec<(String, CircuitState)> {
        let mut status: Vec<(String, CircuitState)> = self
            .services
            .read()
            .values()
            .map(|s| (s.name.clone(), s.breaker.state()))
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    fn service(&self, name: &str) -> Arc<ServiceState> {
        if let Some(state) = self.services.read().get(name) {
            return Arc::clone(state);
        }

        let mut services = self.services.write();
        // Re-check under the write lock.
        if let Some(state) = services.get(name) {
            return Arc::clone(state);
        }

        let (min_delay_ms, max_delay_ms, queue_cap) = self.rate.for_service(name);
        let state = Arc::new(ServiceState {
            name: name.to_string(),
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            breaker: CircuitBreaker::new(self.circuit.clone()),
            delay_ms: AtomicU64::new(min_delay_ms),
            min_delay_ms,
            max_delay_ms,
            queue_cap,
        });
        services.insert(name.to_string(), Arc::clone(&state));

        let worker_state = Arc::clone(&state);
        let client = Arc::clone(&self.client);
        let handle = tokio::spawn(worker_loop(worker_state, client));
        self.workers.lock().push(handle);

        tracing::debug!(service = %name, queue_cap, min_delay_ms, "llm service queue created");
        state
    }
}

impl Drop for LlmGateway {
    fn drop(&mut self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn worker_loop(state: Arc<ServiceState>, client: Arc<dyn LlmClient>) {
    let mut last_dispatch: Option<Instant> = None;

    loop {
        let (job, backlog) = loop {
            let popped = {
                let mut queues = state.queues.lock();
                let backlog = queues.backlog();
                queues
                    .critical
                    .pop_front()
                    .or_else(|| queues.normal.pop_front())
                    .map(|job| (job, backlog))
            };
            match popped {
                Some(entry) => break entry,
                None => state.notify.notified().await,
            }
        };

        // Shorten the spacing when the backlog grows.
        if backlog > BACKLOG_SHORTEN_THRESHOLD {
            let current = state.delay_ms.load(Ordering::Relaxed);
            state
                .delay_ms
                .store((current / 2).max(state.min_delay_ms), Ordering::Relaxed);
        }

        if let Some(last) = last_dispatch {
            let delay = Duration::from_millis(state.delay_ms.load(Ordering::Relaxed));
            let since = last.elapsed();
            if since < delay {
                tokio::time::sleep(delay - since).await;
            }
        }
        last_dispatch = Some(Instant::now());

        let result = execute(&state, client.as_ref(), &job).await;
        if let Err(e) = &result {
            tracing::warn!(service = %state.name, error = %e, "llm request failed");
        }

        let tx = state.queues.lock().inflight.remove(&job.hash);
        if let Some(tx) = tx {
            let _ = tx.send(Arc::new(result));
        }
    }
}

async fn execute(state: &ServiceState, client: &dyn LlmClient, job: &Job) -> Result<String> {
    let mut last_err = Error::Internal("llm request made no attempt".into());

    for attempt in 0..MAX_ATTEMPTS {
        match state.breaker.try_acquire() {
            Admission::Reject => {
                return Err(Error::RateLimited(format!(
                    "circuit open for service '{}'",
                    state.name
                )));
            }
            Admission::Pass | Admission::Probe => {}
        }

        let outcome = tokio::time::timeout(job.timeout, client.complete(&job.req)).await;
        let result = match outcome {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(format!("llm call to '{}'", state.name))),
        };

        match result {
            Ok(text) => {
                state.breaker.record_success();
                return Ok(text);
            }
            Err(e) => {
                state.breaker.record_failure();
                if !e.is_retryable() {
                    return Err(e);
                }
                // Lengthen the spacing on 429/5xx-class failures.
                let current = state.delay_ms.load(Ordering::Relaxed);
                let lengthened =
                    ((current.max(1) * 3) / 2).clamp(state.min_delay_ms, state.max_delay_ms);
                state.delay_ms.store(lengthened, Ordering::Relaxed);

                last_err = e;
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(RETRY_BASE_BACKOFF * 2u32.pow(attempt)).await;
                }
            }
        }
    }

    Err(last_err)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
