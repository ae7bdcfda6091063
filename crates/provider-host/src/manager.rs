//! Provider manager — owns every provider subprocess and routes tool
//! calls to them.
//!
//! Callers address tools by canonical name only; the manager resolves the
//! wire name, enforces per-call deadlines, and folds transport failures
//! into the shared error taxonomy. A provider whose initialize handshake
//! fails is marked disabled for the rest of the run; there is no
//! automatic restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use td_domain::cancel::CancelToken;
use td_domain::config::ProvidersConfig;
use td_domain::error::{Error, Result};

use crate::protocol::{self, ToolCallResult, ToolsListResult};
use crate::registry::ToolRegistry;
use crate::transport::{ProviderTransport, StdioTransport, TransportError};

/// How often an in-flight call re-checks its session's cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(100);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Starting,
    Ready,
    Draining,
    Stopped,
    Failed,
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderState::Starting => "starting",
            ProviderState::Ready => "ready",
            ProviderState::Draining => "draining",
            ProviderState::Stopped => "stopped",
            ProviderState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Readiness snapshot for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub state: ProviderState,
}

struct ProviderHandle {
    name: String,
    state: RwLock<ProviderState>,
    transport: Box<dyn ProviderTransport>,
}

impl ProviderHandle {
    fn state(&self) -> ProviderState {
        *self.state.read()
    }

    /// Recorded state, downgraded to `failed` when the process is gone.
    fn effective_state(&self) -> ProviderState {
        let state = self.state();
        if state == ProviderState::Ready && !self.transport.is_alive() {
            ProviderState::Failed
        } else {
            state
        }
    }

    fn set_state(&self, state: ProviderState) {
        *self.state.write() = state;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ProviderManager {
    providers: HashMap<String, Arc<ProviderHandle>>,
    registry: Arc<ToolRegistry>,
    init_timeout: Duration,
    call_timeout: Duration,
}

impl ProviderManager {
    /// Manager with no providers (chat-only operation).
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
            registry: Arc::new(ToolRegistry::new()),
            init_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(60),
        }
    }

    /// Spawn and initialize every enabled provider from the registry
    /// config. Providers that fail to spawn or initialize are kept in
    /// `failed` state so health reporting can name them.
    pub async fn start(config: &ProvidersConfig) -> Self {
        let mut manager = Self {
            providers: HashMap::new(),
            registry: Arc::new(ToolRegistry::new()),
            init_timeout: Duration::from_millis(config.init_timeout_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        };

        for name in config.enabled_names() {
            let spec = &config.registry[&name];
            tracing::info!(provider = %name, argv = ?spec.argv, "spawning capability provider");

            match StdioTransport::spawn(&name, &spec.argv, &spec.env) {
                Ok(transport) => {
                    if let Some(mut notifications) = transport.take_notifications() {
                        let provider = name.clone();
                        tokio::spawn(async move {
                            while let Some(notif) = notifications.recv().await {
                                tracing::debug!(
                                    provider = %provider,
                                    method = %notif.method,
                                    "server-initiated notification"
                                );
                            }
                        });
                    }
                    manager.attach(&name, Box::new(transport)).await;
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "failed to spawn provider");
                    manager.providers.insert(
                        name.clone(),
                        Arc::new(ProviderHandle {
                            name,
                            state: RwLock::new(ProviderState::Failed),
                            transport: Box::new(DeadTransport),
                        }),
                    );
                }
            }
        }

        tracing::info!(
            providers = manager.providers.len(),
            tools = manager.registry.len(),
            "provider manager ready"
        );
        manager
    }

    /// Attach a transport as a named provider: run the initialize
    /// handshake and discover tools. Used by `start` and by tests with
    /// in-process transports.
    pub async fn attach(&mut self, name: &str, transport: Box<dyn ProviderTransport>) {
        let handle = Arc::new(ProviderHandle {
            name: name.to_string(),
            state: RwLock::new(ProviderState::Starting),
            transport,
        });
        self.providers.insert(name.to_string(), Arc::clone(&handle));

        match self.initialize_provider(&handle).await {
            Ok(tool_count) => {
                handle.set_state(ProviderState::Ready);
                tracing::info!(provider = %name, tools = tool_count, "provider initialized");
            }
            Err(e) => {
                handle.set_state(ProviderState::Failed);
                self.registry.remove_provider(name);
                tracing::warn!(provider = %name, error = %e, "provider initialize failed, disabling");
            }
        }
    }

    async fn initialize_provider(&self, handle: &ProviderHandle) -> Result<usize> {
        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| Error::Internal(format!("serialize initialize params: {e}")))?;

        let resp = handle
            .transport
            .request("initialize", Some(params), self.init_timeout)
            .await
            .map_err(|e| map_transport_error(&handle.name, e))?;
        resp.into_result().map_err(|e| Error::Provider {
            provider: handle.name.clone(),
            message: format!("initialize failed: {e}"),
        })?;

        handle
            .transport
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| map_transport_error(&handle.name, e))?;

        let tools_resp = handle
            .transport
            .request("tools/list", None, self.init_timeout)
            .await
            .map_err(|e| map_transport_error(&handle.name, e))?;
        let tools = match tools_resp.into_result() {
            Ok(value) => serde_json::from_value::<ToolsListResult>(value)
                .map(|r| r.tools)
                .unwrap_or_else(|e| {
                    tracing::warn!(provider = %handle.name, error = %e, "failed to parse tools/list result");
                    Vec::new()
                }),
            Err(e) => {
                tracing::warn!(provider = %handle.name, error = %e, "tools/list returned error");
                Vec::new()
            }
        };

        let count = tools.len();
        self.registry.replace_provider(&handle.name, &tools);
        Ok(count)
    }

    /// Re-run `tools/list` for one provider and atomically replace its
    /// registry entries. Driven by provider reconnection.
    pub async fn refresh_tools(&self, provider: &str) -> Result<usize> {
        let handle = self.handle(provider)?;
        if handle.effective_state() != ProviderState::Ready {
            return Err(provider_disabled(provider));
        }

        let resp = handle
            .transport
            .request("tools/list", None, self.init_timeout)
            .await
            .map_err(|e| map_transport_error(provider, e))?;
        let value = resp.into_result().map_err(|e| Error::Provider {
            provider: provider.to_string(),
            message: e.to_string(),
        })?;
        let tools = serde_json::from_value::<ToolsListResult>(value)
            .map(|r| r.tools)
            .map_err(|e| Error::Provider {
                provider: provider.to_string(),
                message: format!("unparseable tools/list result: {e}"),
            })?;

        let count = tools.len();
        self.registry.replace_provider(provider, &tools);
        tracing::info!(provider = %provider, tools = count, "tool list refreshed");
        Ok(count)
    }

    /// Dispatch a tool call by canonical name.
    ///
    /// Checks the cancel token before dispatch and while waiting; a
    /// session cancel abandons the in-flight request (the correlation
    /// entry is reaped on the late response or on provider exit).
    pub async fn call_tool(
        &self,
        canonical: &str,
        arguments: Value,
        cancel: &CancelToken,
    ) -> Result<ToolCallResult> {
        cancel.ensure_active()?;

        let (provider, wire_name) = self
            .registry
            .wire_name(canonical)
            .ok_or_else(|| Error::ToolNotFound(canonical.to_string()))?;

        let handle = self.handle(&provider)?;
        if handle.effective_state() != ProviderState::Ready {
            return Err(provider_disabled(&provider));
        }

        let params = serde_json::json!({ "name": wire_name, "arguments": arguments });
        tracing::debug!(provider = %provider, tool = %canonical, wire = %wire_name, "dispatching tool call");

        let fut = handle
            .transport
            .request("tools/call", Some(params), self.call_timeout);
        tokio::pin!(fut);

        let resp = loop {
            tokio::select! {
                res = &mut fut => break res.map_err(|e| map_transport_error(&provider, e))?,
                _ = tokio::time::sleep(CANCEL_POLL) => cancel.ensure_active()?,
            }
        };

        let value = resp.into_result().map_err(|e| Error::Provider {
            provider: provider.clone(),
            message: e.to_string(),
        })?;
        serde_json::from_value::<ToolCallResult>(value).map_err(|e| Error::Provider {
            provider,
            message: format!("unparseable tools/call result: {e}"),
        })
    }

    /// Whether a provider exists and is ready.
    pub fn is_ready(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .map(|h| h.effective_state() == ProviderState::Ready)
            .unwrap_or(false)
    }

    /// Names of ready providers, sorted.
    pub fn ready_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .values()
            .filter(|h| h.effective_state() == ProviderState::Ready)
            .map(|h| h.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Per-provider readiness for the health endpoint, sorted by name.
    pub fn health(&self) -> Vec<ProviderHealth> {
        let mut health: Vec<ProviderHealth> = self
            .providers
            .values()
            .map(|h| ProviderHealth {
                name: h.name.clone(),
                state: h.effective_state(),
            })
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    /// The shared canonical tool namespace.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    /// Drain and stop every provider.
    pub async fn shutdown(&self) {
        let futs: Vec<_> = self
            .providers
            .values()
            .map(|handle| async move {
                if handle.state() == ProviderState::Ready {
                    handle.set_state(ProviderState::Draining);
                    handle.transport.shutdown().await;
                    handle.set_state(ProviderState::Stopped);
                }
            })
            .collect();
        futures_util::future::join_all(futs).await;
        tracing::info!("provider manager stopped");
    }

    fn handle(&self, provider: &str) -> Result<&Arc<ProviderHandle>> {
        self.providers.get(provider).ok_or_else(|| Error::Provider {
            provider: provider.to_string(),
            message: "unknown provider".into(),
        })
    }
}

fn provider_disabled(provider: &str) -> Error {
    Error::Provider {
        provider: provider.to_string(),
        message: "provider-disabled".into(),
    }
}

fn map_transport_error(provider: &str, e: TransportError) -> Error {
    match e {
        TransportError::Timeout(id) => {
            Error::Timeout(format!("provider '{provider}' request {id}"))
        }
        TransportError::ProcessExited => Error::ProviderTerminated(provider.to_string()),
        TransportError::Io(e) => Error::Transport(format!("provider '{provider}': {e}")),
        TransportError::Json(e) => Error::Internal(format!("provider '{provider}': {e}")),
    }
}

/// Placeholder transport for providers that never spawned.
struct DeadTransport;

#[async_trait::async_trait]
impl ProviderTransport for DeadTransport {
    async fn request(
        &self,
        _method: &str,
        _params: Option<Value>,
        _timeout: Duration,
    ) -> std::result::Result<crate::protocol::JsonRpcResponse, TransportError> {
        Err(TransportError::ProcessExited)
    }

    async fn notify(
        &self,
        _method: &str,
        _params: Option<Value>,
    ) -> std::result::Result<(), TransportError> {
        Err(TransportError::ProcessExited)
    }

    fn is_alive(&self) -> bool {
        false
    }

    async fn shutdown(&self) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcResponse;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted transport: pops a canned reply per method.
    struct FakeTransport {
        replies: Mutex<HashMap<String, VecDeque<std::result::Result<Value, TransportError>>>>,
        alive: std::sync::atomic::AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                replies: Mutex::new(HashMap::new()),
                alive: std::sync::atomic::AtomicBool::new(true),
            }
        }

        fn script(self, method: &str, reply: std::result::Result<Value, TransportError>) -> Self {
            self.replies
                .lock()
                .entry(method.to_string())
                .or_default()
                .push_back(reply);
            self
        }

        fn healthy(tools: Value) -> Self {
            Self::new()
                .script("initialize", Ok(serde_json::json!({ "capabilities": {} })))
                .script("tools/list", Ok(serde_json::json!({ "tools": tools })))
        }
    }

    #[async_trait::async_trait]
    impl ProviderTransport for FakeTransport {
        async fn request(
            &self,
            method: &str,
            _params: Option<Value>,
            _timeout: Duration,
        ) -> std::result::Result<JsonRpcResponse, TransportError> {
            let reply = self
                .replies
                .lock()
                .get_mut(method)
                .and_then(|q| q.pop_front());
            match reply {
                Some(Ok(result)) => Ok(JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: 1,
                    result: Some(result),
                    error: None,
                }),
                Some(Err(e)) => Err(e),
                None => Err(TransportError::Timeout(0)),
            }
        }

        async fn notify(
            &self,
            _method: &str,
            _params: Option<Value>,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn shutdown(&self) {
            self.alive.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn read_file_tools() -> Value {
        serde_json::json!([
            { "name": "read_file", "description": "Read a file",
              "inputSchema": { "type": "object", "properties": { "path": { "type": "string" } } } }
        ])
    }

    async fn manager_with(name: &str, transport: FakeTransport) -> ProviderManager {
        let mut manager = ProviderManager::empty();
        manager.attach(name, Box::new(transport)).await;
        manager
    }

    #[tokio::test]
    async fn successful_initialize_registers_canonical_tools() {
        let manager = manager_with("filesystem", FakeTransport::healthy(read_file_tools())).await;
        assert!(manager.is_ready("filesystem"));
        assert!(manager.registry().get("filesystem__read_file").is_some());
        assert_eq!(manager.ready_names(), vec!["filesystem"]);
    }

    #[tokio::test]
    async fn failed_initialize_disables_provider() {
        let transport =
            FakeTransport::new().script("initialize", Err(TransportError::ProcessExited));
        let manager = manager_with("gui", transport).await;

        assert!(!manager.is_ready("gui"));
        assert!(manager.registry().is_empty());
        let health = manager.health();
        assert_eq!(health[0].state, ProviderState::Failed);

        let err = manager
            .call_tool("gui__click", serde_json::json!({}), &CancelToken::new())
            .await
            .unwrap_err();
        // Unknown in the registry: the tool was never advertised.
        assert_eq!(err.kind(), "tool-not-found");
    }

    #[tokio::test]
    async fn call_tool_translates_to_wire_name() {
        let transport = FakeTransport::healthy(serde_json::json!([
            { "name": "browser.navigate", "description": "Navigate" }
        ]))
        .script(
            "tools/call",
            Ok(serde_json::json!({ "content": [{ "type": "text", "text": "ok" }] })),
        );
        let manager = manager_with("playwright", transport).await;

        let result = manager
            .call_tool(
                "playwright__browser_navigate",
                serde_json::json!({ "url": "https://example.com" }),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.text(), "ok");
    }

    #[tokio::test]
    async fn call_tool_maps_timeout() {
        let transport = FakeTransport::healthy(read_file_tools())
            .script("tools/call", Err(TransportError::Timeout(9)));
        let manager = manager_with("filesystem", transport).await;

        let err = manager
            .call_tool(
                "filesystem__read_file",
                serde_json::json!({ "path": "/tmp/x" }),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn call_tool_maps_process_exit_to_provider_terminated() {
        let transport = FakeTransport::healthy(read_file_tools())
            .script("tools/call", Err(TransportError::ProcessExited));
        let manager = manager_with("filesystem", transport).await;

        let err = manager
            .call_tool(
                "filesystem__read_file",
                serde_json::json!({ "path": "/tmp/x" }),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider-terminated");
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_dispatch() {
        let manager = manager_with("filesystem", FakeTransport::healthy(read_file_tools())).await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = manager
            .call_tool("filesystem__read_file", serde_json::json!({}), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn unknown_tool_fails_with_tool_not_found() {
        let manager = manager_with("filesystem", FakeTransport::healthy(read_file_tools())).await;
        let err = manager
            .call_tool("filesystem__write_file", serde_json::json!({}), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool-not-found");
    }

    #[tokio::test]
    async fn refresh_tools_replaces_registry_entries() {
        let transport = FakeTransport::healthy(read_file_tools()).script(
            "tools/list",
            Ok(serde_json::json!({ "tools": [{ "name": "write_file" }] })),
        );
        let manager = manager_with("filesystem", transport).await;
        assert!(manager.registry().get("filesystem__read_file").is_some());

        manager.refresh_tools("filesystem").await.unwrap();
        assert!(manager.registry().get("filesystem__read_file").is_none());
        assert!(manager.registry().get("filesystem__write_file").is_some());
    }
}
