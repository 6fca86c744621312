//! Audio Turn Buffer: raw bytes of the current utterance.
//!
//! Append-only between turn start and turn end, drained exactly once per turn. The
//! buffer is bounded; reaching the bound forces the turn to end instead of growing.

use crate::error::{VoiceError, VoiceResult};
use crate::format::SourceEncoding;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Inbound audio settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Encoding of binary frames sent by the client.
    pub source_encoding: SourceEncoding,

    /// Maximum audio per turn for raw PCM (default: 30s).
    pub max_turn_ms: u64,

    /// Hard byte cap per turn, applied to every encoding (default: 4 MiB).
    pub max_turn_bytes: usize,

    /// Largest single binary frame accepted (default: 256 KiB).
    pub max_chunk_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            source_encoding: SourceEncoding::default(),
            max_turn_ms: 30_000,
            max_turn_bytes: 4 * 1024 * 1024,
            max_chunk_bytes: 256 * 1024,
        }
    }
}

impl AudioConfig {
    /// Effective per-turn byte limit: the duration bound (when the encoding has a byte rate)
    /// or the byte cap, whichever is smaller.
    pub fn turn_limit_bytes(&self) -> usize {
        let by_duration = self
            .source_encoding
            .bytes_per_second()
            .map(|bps| (bps * self.max_turn_ms / 1000) as usize);
        match by_duration {
            Some(d) => d.min(self.max_turn_bytes),
            None => self.max_turn_bytes,
        }
        .max(1)
    }
}

/// Result of appending a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Chunk stored; room remains.
    Buffered,
    /// Chunk stored and the turn limit is reached; the turn must end now.
    LimitReached,
}

/// Owns the byte buffer for the current turn.
#[derive(Debug, Clone)]
pub struct AudioAccumulator {
    buffer: Vec<u8>,
    limit: usize,
    max_chunk: usize,
    encoding: SourceEncoding,
}

impl AudioAccumulator {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            buffer: Vec::new(),
            limit: config.turn_limit_bytes(),
            max_chunk: config.max_chunk_bytes,
            encoding: config.source_encoding.clone(),
        }
    }

    /// Append a chunk in arrival order.
    ///
    /// Oversized frames and frames arriving while the buffer is already full are rejected
    /// with [`VoiceError::Ingest`] and leave the buffer untouched.
    pub fn append(&mut self, chunk: &[u8]) -> VoiceResult<AppendOutcome> {
        if chunk.len() > self.max_chunk {
            return Err(VoiceError::Ingest(format!(
                "audio frame of {} bytes exceeds the {} byte limit",
                chunk.len(),
                self.max_chunk
            )));
        }
        if self.buffer.len() >= self.limit {
            return Err(VoiceError::Ingest(format!(
                "turn buffer is full ({} bytes)",
                self.buffer.len()
            )));
        }
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() >= self.limit {
            Ok(AppendOutcome::LimitReached)
        } else {
            Ok(AppendOutcome::Buffered)
        }
    }

    /// Take the whole turn and leave the buffer empty.
    pub fn drain(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Keep only the most recent `window` of timed audio, dropping older bytes on a sample
    /// frame boundary. Returns how many bytes were dropped; encoded streams are left alone.
    pub fn keep_recent(&mut self, window: Duration) -> usize {
        let (Some(bps), SourceEncoding::Pcm16 { channels, .. }) =
            (self.encoding.bytes_per_second(), &self.encoding)
        else {
            return 0;
        };
        let frame = 2 * (*channels).max(1) as usize;
        let keep = (bps as u128 * window.as_millis() / 1000) as usize;
        let keep = keep - keep % frame;
        if self.buffer.len() <= keep {
            return 0;
        }
        let excess = self.buffer.len() - keep;
        let excess = excess + (frame - excess % frame) % frame;
        let excess = excess.min(self.buffer.len());
        self.buffer.drain(..excess);
        excess
    }

    /// Discard buffered audio (turn aborted).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.limit
    }

    /// Buffered audio duration, when the encoding allows computing it.
    pub fn duration(&self) -> Option<Duration> {
        self.encoding.duration_of(self.buffer.len())
    }
}
