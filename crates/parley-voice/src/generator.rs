//! Reply generation: dialogue history in, one complete reply out.
//!
//! The HTTP backend speaks the OpenAI-compatible `/chat/completions` protocol, which
//! covers hosted providers as well as a local Ollama (`http://127.0.0.1:11434/v1`).

use crate::dialogue::{DialogueEntry, Role};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_LLM_BASE: &str = "http://127.0.0.1:11434/v1";
const DEFAULT_MODEL: &str = "gemma3:1b";

/// Instruction prepended to every request: replies are spoken aloud.
pub const VOICE_ASSISTANT_PROMPT: &str = "You are a voice assistant. Your response will be spoken aloud using TTS, \
    so keep it friendly, conversational, and short. Use natural language, \
    plain sentences, and no markdown, lists, or emoji.";

/// Backend producing the assistant's reply for a dialogue snapshot.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Generate the reply to the last user entry in `history`.
    async fn generate(&self, history: &[DialogueEntry]) -> VoiceResult<String>;

    fn name(&self) -> &'static str;
}

/// Placeholder generator: echoes the user, or returns a fixed reply.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderGenerator {
    pub response: Option<String>,
}

impl PlaceholderGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl ReplyGenerator for PlaceholderGenerator {
    async fn generate(&self, history: &[DialogueEntry]) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let last_user = history
            .iter()
            .rev()
            .find(|e| e.role == Role::User)
            .map(|e| e.text.trim())
            .unwrap_or("");
        Ok(format!(
            "You said: {}. Connect a language model for real replies.",
            last_user.trim_end_matches('.')
        ))
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

// OpenAI-compatible request/response
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completion backend.
/// Uses `LLM_API_URL` (default: local Ollama), `LLM_API_KEY` (optional for local servers) and `LLM_MODEL`.
#[derive(Debug, Clone)]
pub struct OpenAiChatGenerator {
    base_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
    client: reqwest::Client,
}

impl OpenAiChatGenerator {
    /// Build from environment. Returns `None` unless `LLM_API_URL` or `LLM_API_KEY` is set.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("LLM_API_URL").ok();
        let api_key = std::env::var("LLM_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if base_url.is_none() && api_key.is_none() {
            return None;
        }
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Some(Self::new(
            base_url.unwrap_or_else(|| DEFAULT_LLM_BASE.to_string()),
            api_key,
            model,
        ))
    }

    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            system_prompt: VOICE_ASSISTANT_PROMPT.to_string(),
            client,
        }
    }

    /// Replace the spoken-reply instruction.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn messages(&self, history: &[DialogueEntry]) -> Vec<ChatMessage> {
        std::iter::once(ChatMessage {
            role: "system".to_string(),
            content: self.system_prompt.clone(),
        })
        .chain(history.iter().map(|e| ChatMessage {
            role: e.role.as_str().to_string(),
            content: e.text.clone(),
        }))
        .collect()
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiChatGenerator {
    async fn generate(&self, history: &[DialogueEntry]) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: self.model.clone(),
            messages: self.messages(history),
            temperature: Some(0.7),
            max_tokens: Some(512),
            stream: false,
        };
        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req
            .send()
            .await
            .map_err(|e| VoiceError::Generation(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Generation(format!("LLM API error {}: {}", status, body)));
        }
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Generation(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| VoiceError::Generation("LLM returned no choices".to_string()))
    }

    fn name(&self) -> &'static str {
        "openai-chat"
    }
}

/// OpenAiChatGenerator when configured in the environment, otherwise the placeholder.
pub fn create_best_generator() -> Arc<dyn ReplyGenerator> {
    match OpenAiChatGenerator::from_env() {
        Some(g) => {
            info!(target: "parley::adapters", "LLM: [OpenAI-compatible] {} ({})", g.base_url, g.model);
            Arc::new(g)
        }
        None => {
            info!(target: "parley::adapters", "LLM: [Placeholder] (set LLM_API_URL or LLM_API_KEY for real replies)");
            Arc::new(PlaceholderGenerator::new())
        }
    }
}
