//! **Text-to-Speech (TTS)**: one sentence in, PCM samples out.
//!
//! Backends may return any sample rate; the synthesis pipeline resamples to
//! [`OUTPUT_SAMPLE_RATE`] before encoding.

use crate::error::{VoiceError, VoiceResult};
use crate::format::{decode_pcm16_le, PcmAudio, OUTPUT_SAMPLE_RATE};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Backend that turns a sentence into audio. Shared across sessions.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    async fn synthesize(&self, text: &str) -> VoiceResult<PcmAudio>;

    fn name(&self) -> &'static str;
}

/// Placeholder TTS: a short stretch of silence per sentence so clients still receive
/// well-formed payloads.
#[derive(Debug, Clone)]
pub struct PlaceholderTts {
    pub silence: Duration,
}

impl Default for PlaceholderTts {
    fn default() -> Self {
        Self {
            silence: Duration::from_millis(250),
        }
    }
}

#[async_trait]
impl TtsBackend for PlaceholderTts {
    async fn synthesize(&self, _text: &str) -> VoiceResult<PcmAudio> {
        let len = (OUTPUT_SAMPLE_RATE as f64 * self.silence.as_secs_f64()) as usize;
        Ok(PcmAudio::new(vec![0.0; len], OUTPUT_SAMPLE_RATE))
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

/// OpenAI-compatible speech API (`/audio/speech`), requested as raw 24 kHz PCM.
/// Uses `TTS_API_URL`, `TTS_API_KEY` (or `OPENAI_API_KEY`), `TTS_MODEL` and `TTS_VOICE`.
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// TTS model: tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// Voice (alloy, echo, fable, onyx, nova, shimmer, ...).
    pub voice: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());
        Ok(Self::new(base_url, api_key, model)?.with_voice(voice))
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: "alloy".to_string(),
            client,
        })
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl TtsBackend for OpenAiTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<PcmAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(PcmAudio::new(Vec::new(), OUTPUT_SAMPLE_RATE));
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis {
                ordinal: 0,
                reason: e.to_string(),
            })?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis {
                ordinal: 0,
                reason: format!("TTS API error {}: {}", status, body),
            });
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Synthesis {
            ordinal: 0,
            reason: e.to_string(),
        })?;
        // "pcm" is 24kHz 16-bit little-endian mono
        Ok(PcmAudio::new(decode_pcm16_le(&bytes), 24_000))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// OpenAiTts when a key is configured, otherwise the placeholder.
pub fn create_best_tts() -> Arc<dyn TtsBackend> {
    match OpenAiTts::from_env() {
        Ok(t) => {
            info!(target: "parley::adapters", "TTS: [OpenAI-compatible] {} voice={}", t.base_url, t.voice);
            Arc::new(t)
        }
        Err(_) => {
            info!(target: "parley::adapters", "TTS: [Placeholder] (set TTS_API_KEY for spoken replies)");
            Arc::new(PlaceholderTts::default())
        }
    }
}
