//! Speech fan-out.
//!
//! The synthesizer itself is an injected collaborator
//! (`synthesize(text, voice) → audio blob`); this service decides *when*
//! to speak and queues the phrase into the session's ordered event
//! stream so audio, chat, and progress arrive coherently.

use std::sync::Arc;

use td_domain::config::SpeechConfig;
use td_domain::error::Result;
use td_domain::event::{EventPayload, StageId};

use crate::coordinator::StreamingCoordinator;

/// Injected text-to-speech backend.
#[async_trait::async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}

/// Backend used when no TTS engine is configured; phrases still flow as
/// text chunks.
pub struct NullSynthesizer;

#[async_trait::async_trait]
impl Synthesizer for NullSynthesizer {
    async fn synthesize(&self, _text: &str, _voice: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

pub struct SpeechService {
    synth: Arc<dyn Synthesizer>,
    config: SpeechConfig,
}

impl SpeechService {
    pub fn new(synth: Arc<dyn Synthesizer>, config: SpeechConfig) -> Self {
        Self { synth, config }
    }

    /// Queue a spoken phrase for the session. Synthesis failures are
    /// logged and never interrupt the workflow.
    pub async fn say(
        &self,
        coordinator: &StreamingCoordinator,
        session_id: &str,
        stage: StageId,
        text: &str,
    ) {
        if !self.config.enabled {
            return;
        }
        if let Err(e) = self.synth.synthesize(text, &self.config.voice).await {
            tracing::debug!(error = %e, "speech synthesis failed");
        }
        coordinator
            .emit(session_id, stage, EventPayload::TtsChunk { text: text.into() })
            .await;
    }
}
