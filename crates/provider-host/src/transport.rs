//! Provider transport layer.
//!
//! A provider is a child process speaking newline-delimited JSON-RPC on
//! stdin/stdout, with stderr reserved for diagnostics. Requests from
//! multiple callers may be in flight at once; a background reader task
//! routes each response to its caller through a pending-request map keyed
//! by request id, so responses may interleave on the wire in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Maximum number of non-JSON lines tolerated on stdout before the
/// provider is declared broken.
const MAX_SKIP_LINES: usize = 1000;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("provider process has exited")]
    ProcessExited,

    #[error("timeout waiting for response to request {0}")]
    Timeout(u64),
}

/// Trait seam for the stdio transport; tests substitute an in-process
/// fake.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// Send a request and wait for the correlated response, up to
    /// `timeout`. On expiry the implementation sends
    /// `notifications/cancelled` for the request before failing.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type PendingMap = Arc<SyncMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Stdio transport with request-id correlation.
pub struct StdioTransport {
    provider: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    /// Server-initiated notifications, surfaced to the manager.
    notifications: SyncMutex<Option<mpsc::UnboundedReceiver<JsonRpcNotification>>>,
}

impl StdioTransport {
    /// Spawn a child process and start its reader tasks.
    pub fn spawn(
        provider: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            ))
        })?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();

        // Reader task: routes responses to pending callers, forwards
        // server notifications, and fails everything on EOF.
        tokio::spawn(reader_loop(
            provider.to_string(),
            BufReader::new(stdout),
            Arc::clone(&pending),
            Arc::clone(&alive),
            notif_tx,
        ));

        // Stderr task: diagnostics only.
        if let Some(stderr) = stderr {
            let provider = provider.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(provider = %provider, line = %line, "provider stderr");
                }
            });
        }

        Ok(Self {
            provider: provider.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            notifications: SyncMutex::new(Some(notif_rx)),
        })
    }

    /// Take the server-notification stream. Returns `None` after the
    /// first call.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcNotification>> {
        self.notifications.lock().take()
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ProviderTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        tracing::debug!(provider = %self.provider, id, method, "sending provider request");
        if let Err(e) = self.write_line(&json).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            // Reader dropped the sender: the process exited.
            Ok(Err(_)) => Err(TransportError::ProcessExited),
            Err(_) => {
                self.pending.lock().remove(&id);
                let cancel = JsonRpcNotification::cancelled(id, "timeout");
                if let Ok(json) = serde_json::to_string(&cancel) {
                    let _ = self.write_line(&json).await;
                }
                Err(TransportError::Timeout(id))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notif)?;
        tracing::debug!(provider = %self.provider, method, "sending provider notification");
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Fail anything still waiting.
        self.pending.lock().clear();

        let mut child = self.child.lock().await;
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(provider = %self.provider, error = %e, "error closing provider stdin");
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(provider = %self.provider, ?status, "provider process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(provider = %self.provider, error = %e, "error waiting for provider process");
            }
            Err(_) => {
                tracing::warn!(provider = %self.provider, "provider did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(provider = %self.provider, error = %e, "failed to kill provider process");
                }
            }
        }
    }
}

/// Background loop over the provider's stdout.
///
/// Messages with an `id` resolve the matching pending request; messages
/// without one are server notifications. On EOF the pending map is
/// drained (dropping each sender fails its caller with
/// [`TransportError::ProcessExited`]) so the map cannot grow without
/// bound after a crash.
async fn reader_loop(
    provider: String,
    stdout: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    notif_tx: mpsc::UnboundedSender<JsonRpcNotification>,
) {
    let mut lines = stdout.lines();
    let mut skipped = 0usize;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('{') {
            // Misconfigured servers sometimes log to stdout.
            skipped += 1;
            tracing::debug!(provider = %provider, line = %trimmed, "skipping non-JSON line on provider stdout");
            if skipped >= MAX_SKIP_LINES {
                tracing::warn!(provider = %provider, "provider produced too many non-JSON lines, closing");
                break;
            }
            continue;
        }

        if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(trimmed) {
            let sender = pending.lock().remove(&resp.id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(resp);
                }
                None => {
                    // Late response to a timed-out request.
                    tracing::debug!(provider = %provider, id = resp.id, "response for unknown request id");
                }
            }
            continue;
        }
        if let Ok(notif) = serde_json::from_str::<JsonRpcNotification>(trimmed) {
            let _ = notif_tx.send(notif);
            continue;
        }
        tracing::debug!(provider = %provider, line = %trimmed, "unparseable message from provider");
    }

    alive.store(false, Ordering::SeqCst);
    let drained = {
        let mut pending = pending.lock();
        let count = pending.len();
        pending.clear();
        count
    };
    if drained > 0 {
        tracing::warn!(provider = %provider, pending = drained, "provider exited with requests in flight");
    } else {
        tracing::info!(provider = %provider, "provider stdout closed");
    }
}
