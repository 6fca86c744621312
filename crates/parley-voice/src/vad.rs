//! Voice Activity Detection behind a pluggable strategy.
//!
//! Two backends ship: an RMS energy gate (pure Rust, no frame-size constraints) and the
//! WebRTC VAD. Which one a session uses is chosen at runtime from [`VadConfig`].

use crate::error::{VoiceError, VoiceResult};
use crate::format::SourceEncoding;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Outcome of classifying one chunk of audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Speech,
    Silence,
}

impl Classification {
    pub fn is_speech(self) -> bool {
        self == Classification::Speech
    }
}

/// Speech/silence classifier. One instance per session, owned by that session.
pub trait VoiceActivityDetector: Send + Sync {
    /// Classify mono PCM samples captured at `sample_rate`.
    fn classify(&mut self, pcm: &[f32], sample_rate: u32) -> VoiceResult<Classification>;

    /// Drop any adaptive state (called when a turn ends).
    fn reset(&mut self) {}

    fn name(&self) -> &'static str;
}

fn default_energy_threshold() -> f32 {
    0.015
}

fn default_webrtc_mode() -> u8 {
    2
}

/// Backend selection and tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum VadConfig {
    /// RMS energy gate: speech when RMS exceeds `threshold` (0.0..1.0 full scale).
    Energy {
        #[serde(default = "default_energy_threshold")]
        threshold: f32,
    },
    /// WebRTC VAD with aggressiveness `mode` (0-3, 3 most aggressive).
    #[serde(rename = "webrtc")]
    WebRtc {
        #[serde(default = "default_webrtc_mode")]
        mode: u8,
    },
}

impl Default for VadConfig {
    fn default() -> Self {
        VadConfig::Energy {
            threshold: default_energy_threshold(),
        }
    }
}

impl VadConfig {
    /// Build a fresh detector for one session.
    pub fn build(&self) -> VoiceResult<Box<dyn VoiceActivityDetector>> {
        match *self {
            VadConfig::Energy { threshold } => Ok(Box::new(EnergyVad::new(threshold)?)),
            VadConfig::WebRtc { mode } => Ok(Box::new(WebRtcVad::new(mode)?)),
        }
    }

    /// Check that the backend can classify audio arriving as `encoding`.
    ///
    /// Only raw PCM is classified per chunk, so other encodings always pass.
    pub fn check_encoding(&self, encoding: &SourceEncoding) -> VoiceResult<()> {
        match (self, encoding) {
            (VadConfig::WebRtc { .. }, SourceEncoding::Pcm16 { sample_rate, .. }) => {
                webrtc_rate(*sample_rate).map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

/// RMS energy gate.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> VoiceResult<Self> {
        if !(0.0..1.0).contains(&threshold) {
            return Err(VoiceError::Config(format!(
                "energy VAD threshold must be in [0, 1), got {}",
                threshold
            )));
        }
        Ok(Self { threshold })
    }
}

/// Root-mean-square level of `samples`; 0.0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, pcm: &[f32], _sample_rate: u32) -> VoiceResult<Classification> {
        let level = rms(pcm);
        Ok(if level > self.threshold {
            Classification::Speech
        } else {
            Classification::Silence
        })
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

/// WebRTC VAD. Chunks are cut into 30ms frames; the chunk is speech if any frame is.
///
/// The underlying `Vad` handle is not `Send`, so it is created per call from the stored
/// mode; WebRTC's per-frame decision does not depend on earlier chunks.
#[derive(Debug, Clone)]
pub struct WebRtcVad {
    mode: u8,
}

impl WebRtcVad {
    pub fn new(mode: u8) -> VoiceResult<Self> {
        if mode > 3 {
            return Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", mode)));
        }
        info!("Initializing WebRTC VAD (mode: {})", mode);
        Ok(Self { mode })
    }

    fn vad_mode(&self) -> VadMode {
        match self.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        }
    }
}

fn webrtc_rate(sample_rate: u32) -> VoiceResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::Config(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

impl VoiceActivityDetector for WebRtcVad {
    fn classify(&mut self, pcm: &[f32], sample_rate: u32) -> VoiceResult<Classification> {
        let rate = webrtc_rate(sample_rate)?;
        // 30ms frames: 480 samples at 16kHz
        let frame_len = (sample_rate as usize * 30) / 1000;

        let mut samples: Vec<i16> = pcm
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        if samples.len() < frame_len {
            samples.resize(frame_len, 0);
        }

        let mut vad = Vad::new();
        vad.set_mode(self.vad_mode());
        vad.set_sample_rate(rate);

        for frame in samples.chunks_exact(frame_len) {
            let voiced = vad.is_voice_segment(frame).map_err(|_| {
                VoiceError::Ingest(format!("WebRTC VAD rejected a {}-sample frame", frame.len()))
            })?;
            if voiced {
                debug!("VAD result: SPEECH");
                return Ok(Classification::Speech);
            }
        }
        Ok(Classification::Silence)
    }

    fn name(&self) -> &'static str {
        "webrtc"
    }
}
