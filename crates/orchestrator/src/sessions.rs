//! In-memory session store.
//!
//! A session owns its cancel token, pause gate, active TODO, and the
//! ordered event history used for reconnection replay. Nothing is
//! persisted; a restart begins with an empty map. A background sweeper
//! evicts sessions idle for longer than the configured timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use td_domain::cancel::CancelToken;
use td_domain::config::{Mode, SessionConfig};
use td_domain::error::Result;
use td_domain::event::Event;
use td_domain::todo::Todo;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pause gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pause is cooperative: the executor blocks at the next stage boundary
/// and resumes when the flag clears. No stage is ever left mid-call.
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

impl PauseGate {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Block while paused, still honouring cancellation.
    pub async fn wait_while_paused(&self, cancel: &CancelToken) -> Result<()> {
        while self.is_paused() {
            cancel.ensure_active()?;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
        cancel.ensure_active()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Session {
    pub id: String,
    pub mode: Mode,
    pub cancel: CancelToken,
    /// The active TODO, if a workflow is or was running.
    pub todo: Option<Todo>,
    /// A workflow is currently executing for this session.
    pub running: bool,
    pub last_activity: DateTime<Utc>,
    /// Ordered event history for replay.
    pub events: Vec<Event>,
    /// Highest sequence number delivered to any connection.
    pub delivered_seq: u64,
    next_seq: u64,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            mode: Mode::Task,
            cancel: CancelToken::new(),
            todo: None,
            running: false,
            last_activity: Utc::now(),
            events: Vec::new(),
            delivered_seq: 0,
            next_seq: 0,
        }
    }

    /// Allocate the next strictly increasing sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// A session plus its await-side primitives that must live outside the
/// data lock.
pub struct SessionHandle {
    pub data: Mutex<Session>,
    pub pause: PauseGate,
}

impl SessionHandle {
    fn new(id: String) -> Self {
        Self {
            data: Mutex::new(Session::new(id)),
            pause: PauseGate::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolve an existing session or create one. Returns
    /// `(id, handle, is_new)`.
    pub fn resolve_or_create(&self, id: Option<&str>) -> (String, Arc<SessionHandle>, bool) {
        if let Some(id) = id {
            // Fast path: session already exists.
            if let Some(handle) = self.sessions.read().get(id) {
                handle.data.lock().touch();
                return (id.to_string(), Arc::clone(handle), false);
            }
        }

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut sessions = self.sessions.write();
        if let Some(handle) = sessions.get(&id) {
            return (id.clone(), Arc::clone(handle), false);
        }
        let handle = Arc::new(SessionHandle::new(id.clone()));
        sessions.insert(id.clone(), Arc::clone(&handle));
        tracing::info!(session_id = %id, "session created");
        (id, handle, true)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Evict sessions idle beyond the configured timeout. Cancels the
    /// evicted sessions' tokens and reports their ids.
    pub fn sweep(&self) -> Vec<String> {
        let idle = chrono::Duration::milliseconds(self.config.idle_timeout_ms as i64);
        let now = Utc::now();
        let mut evicted = Vec::new();

        let mut sessions = self.sessions.write();
        sessions.retain(|id, handle| {
            let data = handle.data.lock();
            let keep = data.running || now - data.last_activity < idle;
            if !keep {
                data.cancel.cancel();
                evicted.push(id.clone());
            }
            keep
        });
        drop(sessions);

        for id in &evicted {
            tracing::info!(session_id = %id, "session evicted after idle timeout");
        }
        evicted
    }

    /// Background eviction loop. `on_evict` lets the caller release
    /// per-session state held elsewhere (inspector counters).
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        on_evict: Arc<dyn Fn(&str) + Send + Sync>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = Duration::from_millis(store.config.sweep_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                for id in store.sweep() {
                    on_evict(&id);
                }
            }
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
