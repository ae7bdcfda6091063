//! The injected LLM client seam and its request types.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use td_domain::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: text.into(),
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: text.into(),
        }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: text.into(),
        }
    }
}

/// A completion request in the shape the injected client expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
}

impl CompletionRequest {
    /// Stable hash over the full request body; the single-flight key.
    pub fn body_hash(&self) -> String {
        let body = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }
}

/// Queue priority; critical stages (verification) are served before
/// normal traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Critical,
}

/// The injected collaborator: given a request, returns a text completion.
/// Implementations wrap whatever HTTP API the operator configured.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(content: &str) -> CompletionRequest {
        CompletionRequest {
            model: "default".into(),
            temperature: 0.1,
            max_tokens: 1024,
            messages: vec![ChatMessage::user(content)],
        }
    }

    #[test]
    fn body_hash_is_stable_and_distinguishes_content() {
        let a = request("hello");
        let b = request("hello");
        let c = request("goodbye");
        assert_eq!(a.body_hash(), b.body_hash());
        assert_ne!(a.body_hash(), c.body_hash());
    }

    #[test]
    fn body_hash_distinguishes_model_and_temperature() {
        let a = request("hello");
        let mut b = request("hello");
        b.model = "default-mini".into();
        let mut c = request("hello");
        c.temperature = 0.9;
        assert_ne!(a.body_hash(), b.body_hash());
        assert_ne!(a.body_hash(), c.body_hash());
    }
}
