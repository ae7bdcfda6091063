//! Shared fixtures for orchestrator tests: a prompt-routed scripted LLM
//! client, an in-process provider transport, and state construction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use td_domain::config::Config;
use td_domain::error::{Error, Result};
use td_llm::{CompletionRequest, LlmClient, LlmGateway};
use td_pipeline::{Inspector, ToolHistory, ValidationPipeline};
use td_provider_host::protocol::JsonRpcResponse;
use td_provider_host::transport::{ProviderTransport, TransportError};
use td_provider_host::ProviderManager;

use crate::approval::ApprovalStore;
use crate::coordinator::StreamingCoordinator;
use crate::sessions::SessionStore;
use crate::speech::{NullSynthesizer, SpeechService};
use crate::stages::Stages;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routes each prompt to a canned response by substring key. A key's
/// queue pops until one entry remains; the last entry is reused, so a
/// single response can serve any number of repeat calls.
pub struct RouterClient {
    responses: Mutex<Vec<(String, VecDeque<String>)>>,
}

impl RouterClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, key: &str, response: &str) -> Self {
        {
            let mut responses = self.responses.lock();
            match responses.iter_mut().find(|(k, _)| k == key) {
                Some((_, queue)) => queue.push_back(response.to_string()),
                None => responses.push((key.to_string(), VecDeque::from([response.to_string()]))),
            }
        }
        self
    }
}

#[async_trait::async_trait]
impl LlmClient for RouterClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<String> {
        let prompt: String = req
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut responses = self.responses.lock();
        for (key, queue) in responses.iter_mut() {
            if prompt.contains(key.as_str()) {
                let response = if queue.len() > 1 {
                    queue.pop_front().unwrap_or_default()
                } else {
                    queue.front().cloned().unwrap_or_default()
                };
                return Ok(response);
            }
        }
        Err(Error::Internal(format!(
            "no scripted response for prompt: {}",
            prompt.chars().take(80).collect::<String>()
        )))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pops a canned reply per method; the last reply for a method is
/// reused.
pub struct FakeTransport {
    replies: Mutex<HashMap<String, VecDeque<std::result::Result<Value, String>>>>,
    alive: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        }
    }

    pub fn script(self, method: &str, reply: Value) -> Self {
        self.replies
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(reply));
        self
    }

    /// A provider that initializes cleanly and advertises `tools`.
    pub fn healthy(tools: Value) -> Self {
        Self::new()
            .script("initialize", serde_json::json!({ "capabilities": {} }))
            .script("tools/list", serde_json::json!({ "tools": tools }))
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
        let reply = {
            let mut replies = self.replies.lock();
            match replies.get_mut(method) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match reply {
            Some(Ok(result)) => Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: 1,
                result: Some(result),
                error: None,
            }),
            Some(Err(_)) | None => Err(TransportError::Timeout(0)),
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
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The filesystem provider tool set used across tests.
pub fn filesystem_tools() -> Value {
    serde_json::json!([
        { "name": "read_file", "description": "Read a file",
          "inputSchema": { "type": "object",
            "properties": { "path": { "type": "string" } }, "required": ["path"] } },
        { "name": "write_file", "description": "Write a file",
          "inputSchema": { "type": "object",
            "properties": { "path": { "type": "string" }, "content": { "type": "string" } },
            "required": ["path", "content"] } }
    ])
}

/// Build a full AppState around scripted collaborators. No background
/// sweeper is spawned.
pub async fn test_state(
    config: Config,
    client: Arc<dyn LlmClient>,
    fakes: Vec<(&str, FakeTransport)>,
) -> AppState {
    let config = Arc::new(config);

    let mut manager = ProviderManager::empty();
    for (name, transport) in fakes {
        manager.attach(name, Box::new(transport)).await;
    }
    let providers = Arc::new(manager);

    let history = Arc::new(ToolHistory::new(config.history.max_size));
    let pipeline = Arc::new(ValidationPipeline::new(
        config.validation.clone(),
        Arc::clone(&history),
        providers.registry(),
    ));
    let inspector = Arc::new(Inspector::new(config.inspector.clone()).unwrap());
    let gateway = Arc::new(LlmGateway::new(
        client,
        config.rate_limit.clone(),
        config.circuit.clone(),
    ));
    let sessions = Arc::new(SessionStore::new(config.session.clone()));
    let coordinator = Arc::new(StreamingCoordinator::new(
        Arc::clone(&sessions),
        config.session.clone(),
    ));
    let approvals = Arc::new(ApprovalStore::new(Duration::from_millis(
        config.session.approval_timeout_ms,
    )));
    let speech = Arc::new(SpeechService::new(
        Arc::new(NullSynthesizer),
        config.speech.clone(),
    ));

    AppState {
        config,
        gateway,
        providers,
        stages: Arc::new(Stages::new()),
        pipeline,
        history,
        inspector,
        sessions,
        coordinator,
        approvals,
        speech,
    }
}

/// A rate-limit config with no artificial spacing, for fast tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.rate_limit.min_delay_ms = 0;
    config
}
