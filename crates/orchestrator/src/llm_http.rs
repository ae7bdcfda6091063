//! Bundled OpenAI-compatible completion client.
//!
//! The gateway treats the LLM client as an injected collaborator;
//! embedders supply their own. This default implementation covers the
//! common case of an OpenAI-compatible `chat/completions` endpoint
//! configured via `[llm] api_base` and an API key environment variable.

use serde::Deserialize;

use td_domain::error::{Error, Result};
use td_llm::{ChatRole, CompletionRequest, LlmClient};

pub struct HttpLlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

impl HttpLlmClient {
    pub fn new(api_base: String, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<String> {
        let messages: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                };
                serde_json::json!({ "role": role, "content": m.content })
            })
            .collect();

        let body = serde_json::json!({
            "model": req.model,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "messages": messages,
        });

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("llm endpoint unreachable: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited("llm endpoint returned 429".into()));
        }
        if status.is_server_error() {
            return Err(Error::Transport(format!("llm endpoint returned {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!("llm endpoint returned {status}: {text}")));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("unparseable llm response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Internal("llm response has no choices".into()))
    }
}

/// Used when no `[llm] api_base` is configured: every call fails with a
/// clear configuration error while the rest of the server (health,
/// providers) stays usable.
pub struct UnconfiguredLlmClient;

#[async_trait::async_trait]
impl LlmClient for UnconfiguredLlmClient {
    async fn complete(&self, _req: &CompletionRequest) -> Result<String> {
        Err(Error::Config(
            "no LLM endpoint configured; set [llm] api_base or embed a custom client".into(),
        ))
    }
}
