//! Audio formats at the edges of the pipeline.
//!
//! Inbound audio is normalized once per turn to 16 kHz mono PCM before transcription.
//! Outbound speech is always a 24 kHz, 16-bit, mono WAV; both rates are system-wide
//! constants and are never negotiated per turn.

use crate::error::{VoiceError, VoiceResult};
use crate::staging::StagingArea;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// Sample rate handed to speech-to-text backends.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of every synthesized payload sent to the client.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Encoding of the raw bytes a client streams in binary frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceEncoding {
    /// Headerless little-endian 16-bit PCM.
    Pcm16 { sample_rate: u32, channels: u16 },
    /// A complete RIFF/WAVE file split across chunks.
    Wav,
    /// A compressed container (e.g. `webm` from a browser MediaRecorder); needs ffmpeg.
    Container { extension: String },
}

impl Default for SourceEncoding {
    fn default() -> Self {
        SourceEncoding::Pcm16 {
            sample_rate: INPUT_SAMPLE_RATE,
            channels: 1,
        }
    }
}

impl SourceEncoding {
    /// Byte rate for raw PCM; `None` when the stream is encoded and cannot be timed per chunk.
    pub fn bytes_per_second(&self) -> Option<u64> {
        match *self {
            SourceEncoding::Pcm16 {
                sample_rate,
                channels,
            } => Some(sample_rate as u64 * channels.max(1) as u64 * 2),
            _ => None,
        }
    }

    /// Playback duration of `len` bytes, when it can be known without decoding.
    pub fn duration_of(&self, len: usize) -> Option<Duration> {
        self.bytes_per_second()
            .filter(|&bps| bps > 0)
            .map(|bps| Duration::from_nanos((len as u128 * 1_000_000_000 / bps as u128) as u64))
    }
}

/// Mono f32 PCM (-1.0..1.0) at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Encode as 16-bit mono WAV.
    pub fn to_wav_bytes(&self) -> VoiceResult<Vec<u8>> {
        encode_wav(&self.samples, self.sample_rate)
    }
}

/// Decode little-endian 16-bit PCM. A trailing odd byte is ignored.
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler; adequate for speech bandwidth.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

/// Encode f32 samples as a 16-bit mono WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample((s.clamp(-1.0, 1.0) * 32767.0).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV file to mono f32 at its native sample rate.
pub fn decode_wav(bytes: &[u8]) -> VoiceResult<PcmAudio> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    Ok(PcmAudio::new(
        downmix(&interleaved, spec.channels),
        spec.sample_rate,
    ))
}

/// Converts one turn's raw bytes into 16 kHz mono PCM.
#[async_trait]
pub trait AudioNormalizer: Send + Sync {
    async fn normalize(&self, raw: &[u8], source: &SourceEncoding) -> VoiceResult<PcmAudio>;
}

/// In-process PCM/WAV conversion, with ffmpeg for compressed containers.
#[derive(Debug, Clone)]
pub struct DefaultNormalizer {
    staging: StagingArea,
    ffmpeg: String,
}

impl Default for DefaultNormalizer {
    fn default() -> Self {
        Self::new(StagingArea::default())
    }
}

impl DefaultNormalizer {
    pub fn new(staging: StagingArea) -> Self {
        Self {
            staging,
            ffmpeg: "ffmpeg".to_string(),
        }
    }

    /// Use a specific ffmpeg binary instead of the one on `PATH`.
    pub fn with_ffmpeg(mut self, program: impl Into<String>) -> Self {
        self.ffmpeg = program.into();
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    async fn convert_container(&self, raw: &[u8], extension: &str) -> VoiceResult<PcmAudio> {
        let suffix = format!(".{}", extension.trim_start_matches('.'));
        let input = self.staging.acquire(&suffix)?;
        let output = self.staging.acquire(".wav")?;
        input.write_all(raw).await?;

        let result = tokio::process::Command::new(&self.ffmpeg)
            .arg("-y")
            .args(["-loglevel", "error"])
            .arg("-i")
            .arg(input.path())
            .args(["-ar", "16000", "-ac", "1"])
            .arg(output.path())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VoiceError::Normalization(format!("failed to run {}: {}", self.ffmpeg, e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(VoiceError::Normalization(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        let wav = output.read_all().await?;
        input.release()?;
        output.release()?;
        decode_wav(&wav)
    }
}

#[async_trait]
impl AudioNormalizer for DefaultNormalizer {
    async fn normalize(&self, raw: &[u8], source: &SourceEncoding) -> VoiceResult<PcmAudio> {
        if raw.is_empty() {
            return Ok(PcmAudio::new(Vec::new(), INPUT_SAMPLE_RATE));
        }
        let pcm = match source {
            SourceEncoding::Pcm16 {
                sample_rate,
                channels,
            } => PcmAudio::new(downmix(&decode_pcm16_le(raw), *channels), *sample_rate),
            SourceEncoding::Wav => decode_wav(raw)?,
            SourceEncoding::Container { extension } => {
                self.convert_container(raw, extension).await?
            }
        };
        debug!(
            "normalized {} bytes -> {} samples @ {}Hz",
            raw.len(),
            pcm.samples.len(),
            pcm.sample_rate
        );
        Ok(PcmAudio::new(
            resample_linear(&pcm.samples, pcm.sample_rate, INPUT_SAMPLE_RATE),
            INPUT_SAMPLE_RATE,
        ))
    }
}
