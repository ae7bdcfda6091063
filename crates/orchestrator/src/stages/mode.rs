//! Stage 0 — mode router.
//!
//! Classifies the user message into chat/task/dev. Deterministic overlays
//! run first: the configured access code forces dev mode, and per-locale
//! keyword lists force a mode without consulting the classifier. Dev mode
//! is only ever honoured when the access code is present.

use serde::Deserialize;
use subtle::ConstantTimeEq;

use td_domain::config::Mode;
use td_domain::error::Result;
use td_domain::event::StageId;
use td_llm::{ChatMessage, Priority};

use super::{extract_json, stage_completion, StageContext, StageOutput, StageProcessor};

pub struct ModeStage;

#[derive(Debug, Deserialize)]
struct ModeVerdict {
    mode: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    requires_privilege: bool,
}

#[async_trait::async_trait]
impl StageProcessor for ModeStage {
    fn id(&self) -> StageId {
        StageId::Mode
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let has_code = message_contains_access_code(
            ctx.user_message,
            ctx.config.mode.access_code.as_deref(),
        );

        // Rule overlay: the access code alone forces dev mode.
        if has_code {
            return Ok(StageOutput::Mode {
                mode: Mode::Dev,
                confidence: 1.0,
                reply: None,
            });
        }

        // Keyword overlays; a dev keyword without the code falls through.
        if let Some(mode) = keyword_overlay(ctx) {
            if mode != Mode::Dev {
                return Ok(StageOutput::Mode {
                    mode,
                    confidence: 1.0,
                    reply: None,
                });
            }
        }

        let (mode, confidence) = classify(ctx).await;
        // Dev from the classifier is never honoured without the code.
        let mode = if mode == Mode::Dev { Mode::Task } else { mode };

        let reply = if mode == Mode::Chat {
            Some(chat_reply(ctx).await?)
        } else {
            None
        };

        Ok(StageOutput::Mode { mode, confidence, reply })
    }
}

/// Token-wise constant-time comparison against the configured code.
fn message_contains_access_code(message: &str, code: Option<&str>) -> bool {
    let Some(code) = code else {
        return false;
    };
    message.split_whitespace().any(|token| {
        token.len() == code.len() && token.as_bytes().ct_eq(code.as_bytes()).into()
    })
}

fn keyword_overlay(ctx: &StageContext<'_>) -> Option<Mode> {
    let message = ctx.user_message.to_lowercase();
    for overlay in &ctx.config.mode.keyword_overlays {
        if overlay
            .keywords
            .iter()
            .any(|k| !k.is_empty() && message.contains(&k.to_lowercase()))
        {
            return Some(overlay.mode);
        }
    }
    None
}

async fn classify(ctx: &StageContext<'_>) -> (Mode, f32) {
    let prompt = format!(
        "Classify the user message into exactly one mode.\n\
         - \"chat\": small talk, questions answerable directly, no tools needed\n\
         - \"task\": the user wants actions performed against files, shell, browser, or other tools\n\
         - \"dev\": the user asks the assistant to analyse its own logs or configuration\n\
         Reply with JSON only: {{\"mode\": \"...\", \"confidence\": 0.0-1.0, \"requires_privilege\": bool}}\n\n\
         Message: {}",
        ctx.user_message
    );
    let messages = vec![ChatMessage::user(prompt)];

    let reply = stage_completion(
        ctx,
        &ctx.config.llm.stages.mode,
        "mode-router",
        Priority::Normal,
        messages,
    )
    .await;

    let verdict = reply
        .ok()
        .and_then(|text| extract_json(&text))
        .and_then(|v| serde_json::from_value::<ModeVerdict>(v).ok());

    match verdict {
        Some(v) => {
            let mode = match v.mode.as_str() {
                "task" => Mode::Task,
                "dev" if v.requires_privilege => Mode::Dev,
                "dev" => Mode::Task,
                _ => Mode::Chat,
            };
            (mode, v.confidence.clamp(0.0, 1.0))
        }
        // Unparseable classification degrades to harmless chat.
        None => (Mode::Chat, 0.0),
    }
}

async fn chat_reply(ctx: &StageContext<'_>) -> Result<String> {
    let messages = vec![
        ChatMessage::system("You are a helpful assistant. Answer in the user's language."),
        ChatMessage::user(ctx.user_message),
    ];
    stage_completion(
        ctx,
        &ctx.config.llm.stages.chat,
        "chat",
        Priority::Normal,
        messages,
    )
    .await
}
