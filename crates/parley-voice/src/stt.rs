//! **Speech-to-Text (STT)**: turn a normalized turn (16 kHz mono PCM) into text.
//!
//! Implement `SttBackend` for local Whisper (whisper-rs) or a remote OpenAI-compatible
//! transcription endpoint. Backends are shared by every session and must tolerate
//! concurrent calls.

use crate::error::{VoiceError, VoiceResult};
use crate::format::PcmAudio;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Backend for converting PCM to text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Transcribe one turn. Return an empty string when nothing was said.
    async fn transcribe(&self, audio: &PcmAudio) -> VoiceResult<String>;

    fn name(&self) -> &'static str;
}

/// Placeholder STT: returns a fixed string. Use for exercising sessions without a model or API.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
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
impl SttBackend for PlaceholderStt {
    async fn transcribe(&self, audio: &PcmAudio) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        if audio.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(
            "[STT placeholder: {} samples, {:.1}s]",
            audio.samples.len(),
            audio.duration().as_secs_f32()
        ))
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper, faster-whisper servers, etc.).
/// Uses `STT_API_URL` (e.g. https://api.openai.com/v1), `STT_API_KEY`, and `STT_MODEL` (default whisper-1).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Model: whisper-1, gpt-4o-transcribe, etc.
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiStt {
    /// Build from environment: STT_API_URL, STT_API_KEY (or OPENAI_API_KEY), STT_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| VoiceError::Config("STT requires STT_API_KEY or OPENAI_API_KEY".to_string()))?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    /// Create with explicit config.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl SttBackend for OpenAiStt {
    async fn transcribe(&self, audio: &PcmAudio) -> VoiceResult<String> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        let wav = audio.to_wav_bytes()?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// -----------------------------------------------------------------------------
// Local Whisper STT (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use crate::format::INPUT_SAMPLE_RATE;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper STT on a ggml model (e.g. ggml-base.en.bin). Inference runs on the
    /// blocking pool; concurrent sessions queue on the shared state.
    pub struct WhisperStt {
        state: Arc<Mutex<whisper_rs::WhisperState>>,
    }

    impl WhisperStt {
        /// Load the Whisper model from `model_path`.
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let context =
                WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                    .map_err(|e| VoiceError::Config(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Config(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                state: Arc::new(Mutex::new(state)),
            })
        }

        /// Build from env: `WHISPER_MODEL_PATH` must point to a .bin model file.
        pub fn from_env() -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path)
        }
    }

    #[async_trait]
    impl SttBackend for WhisperStt {
        async fn transcribe(&self, audio: &PcmAudio) -> VoiceResult<String> {
            if audio.is_empty() {
                return Ok(String::new());
            }
            if audio.sample_rate != INPUT_SAMPLE_RATE {
                return Err(VoiceError::Transcription(format!(
                    "Whisper expects {} Hz; got {} Hz",
                    INPUT_SAMPLE_RATE, audio.sample_rate
                )));
            }
            let state = Arc::clone(&self.state);
            let samples = audio.samples.clone();
            tokio::task::spawn_blocking(move || {
                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_no_timestamps(true);
                params.set_language(Some("en"));

                let mut state = state
                    .lock()
                    .map_err(|e| VoiceError::Transcription(format!("Whisper lock poisoned: {}", e)))?;
                state
                    .full(params, &samples)
                    .map_err(|e| VoiceError::Transcription(format!("Whisper inference failed: {}", e)))?;
                Ok(state
                    .as_iter()
                    .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim()
                    .to_string())
            })
            .await
            .map_err(|e| VoiceError::Transcription(format!("Whisper task failed: {}", e)))?
        }

        fn name(&self) -> &'static str {
            "whisper"
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Create the best available STT backend from environment.
/// Priority: (1) WhisperStt if `WHISPER_MODEL_PATH` is set and the model loads (requires the
/// `whisper` feature), (2) OpenAiStt if `STT_API_KEY`/`OPENAI_API_KEY` is set, (3) PlaceholderStt.
pub fn create_best_stt() -> Arc<dyn SttBackend> {
    #[cfg(feature = "whisper")]
    {
        if let Ok(w) = whisper_stt::WhisperStt::from_env() {
            info!(target: "parley::adapters", "STT: [Whisper] (local)");
            return Arc::new(w);
        }
    }
    if let Ok(open) = OpenAiStt::from_env() {
        info!(target: "parley::adapters", "STT: [OpenAI-compatible] {}", open.base_url);
        return Arc::new(open);
    }
    info!(target: "parley::adapters", "STT: [Placeholder] (set STT_API_KEY or WHISPER_MODEL_PATH for real transcription)");
    Arc::new(PlaceholderStt::new())
}
