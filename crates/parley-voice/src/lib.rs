//! # Parley Voice - Duplex Voice Session Orchestration
//!
//! Turns a live, chunked audio upload into a streamed, sentence-by-sentence spoken reply.
//! Speech-to-text, reply generation and text-to-speech are pluggable adapters shared by
//! every session; this crate sequences them per connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         Session (one per connection)              │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐   │
//! │  │ Audio frames │ → │ Turn Detector│ → │ Audio Accumulator    │   │
//! │  │  + <END>     │   │ (VAD + gap)  │   │ (bounded turn buffer)│   │
//! │  └──────────────┘   └──────────────┘   └──────────────────────┘   │
//! │                                                  ↓ drain          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐   │
//! │  │  Normalizer  │ → │     STT      │ → │ Dialogue + Generator │   │
//! │  │ (16 kHz mono)│   │              │   │                      │   │
//! │  └──────────────┘   └──────────────┘   └──────────────────────┘   │
//! │                                                  ↓ reply          │
//! │  ┌──────────────┐   ┌──────────────────────────────────────────┐  │
//! │  │  Segmenter   │ → │ Synthesis Pipeline (lookahead, reorder)  │ → client
//! │  └──────────────┘   └──────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod accumulator;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod format;
pub mod generator;
pub mod manager;
pub mod protocol;
pub mod segmenter;
pub mod session;
pub mod staging;
pub mod stt;
pub mod synthesis;
pub mod tts;
pub mod turn;
pub mod vad;

pub use accumulator::{AppendOutcome, AudioAccumulator, AudioConfig};
pub use config::{MidTurnAudioPolicy, SessionConfig};
pub use dialogue::{DialogueEntry, DialogueHistory, Role};
pub use error::{Severity, VoiceError, VoiceResult};
pub use format::{
    AudioNormalizer, DefaultNormalizer, PcmAudio, SourceEncoding, INPUT_SAMPLE_RATE,
    OUTPUT_SAMPLE_RATE,
};
pub use generator::{
    create_best_generator, OpenAiChatGenerator, PlaceholderGenerator, ReplyGenerator,
    VOICE_ASSISTANT_PROMPT,
};
pub use manager::{SessionInfo, SessionManager};
pub use protocol::{ClientFrame, ServerMessage, CANCEL_MARKER, END_MARKER};
pub use segmenter::segment;
pub use session::{Adapters, CloseReason, Session, SessionPhase, SessionSummary};
pub use staging::{StagedArtifact, StagingArea};
pub use stt::{create_best_stt, OpenAiStt, PlaceholderStt, SttBackend};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use synthesis::{ReorderBuffer, SentenceUnit, SynthesisPipeline, TurnReport};
pub use tts::{create_best_tts, OpenAiTts, PlaceholderTts, TtsBackend};
pub use turn::{should_end_turn, ClassificationHistory, Observation, TurnConfig, TurnDetector};
pub use vad::{Classification, EnergyVad, VadConfig, VoiceActivityDetector, WebRtcVad};
