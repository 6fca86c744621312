//! Per-session configuration.

use crate::accumulator::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::turn::TurnConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};

/// Upper bound on `synthesis_lookahead`; more only buffers audio ahead of the client.
pub const MAX_SYNTHESIS_LOOKAHEAD: usize = 8;

/// What to do with audio that arrives while a turn is being processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidTurnAudioPolicy {
    /// Keep it as the start of the next turn.
    #[default]
    Buffer,
    /// Drop it and tell the client.
    Reject,
}

/// Configuration for one voice session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub turn: TurnConfig,

    /// Most recent dialogue entries handed to the generator (default: 20).
    pub history_window: usize,

    /// Sentences synthesized ahead of the one being delivered (default: 2, range 1-8).
    pub synthesis_lookahead: usize,

    pub mid_turn_audio: MidTurnAudioPolicy,

    /// Skip transcription when no chunk was classified as speech (default: true).
    pub skip_silent_turns: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            turn: TurnConfig::default(),
            history_window: 20,
            synthesis_lookahead: 2,
            mid_turn_audio: MidTurnAudioPolicy::default(),
            skip_silent_turns: true,
        }
    }
}

impl SessionConfig {
    /// Reject values that would stall or disable a session.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.history_window == 0 {
            return Err(VoiceError::Config("history_window must be at least 1".to_string()));
        }
        if self.audio.max_chunk_bytes == 0 || self.audio.max_turn_bytes == 0 {
            return Err(VoiceError::Config("audio byte limits must be non-zero".to_string()));
        }
        if self.turn.silence_threshold_ms == 0 {
            return Err(VoiceError::Config(
                "turn.silence_threshold_ms must be non-zero".to_string(),
            ));
        }
        if self.turn.pre_roll_ms >= self.audio.max_turn_ms {
            return Err(VoiceError::Config(
                "turn.pre_roll_ms must be shorter than audio.max_turn_ms".to_string(),
            ));
        }
        // Zero would serialize synthesis behind delivery.
        if self.synthesis_lookahead == 0 || self.synthesis_lookahead > MAX_SYNTHESIS_LOOKAHEAD {
            return Err(VoiceError::Config(format!(
                "synthesis_lookahead must be between 1 and {}, got {}",
                MAX_SYNTHESIS_LOOKAHEAD, self.synthesis_lookahead
            )));
        }
        // Fails on an out-of-range VAD tuning.
        self.vad.build()?;
        self.vad.check_encoding(&self.audio.source_encoding)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SourceEncoding;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mid_turn_audio, MidTurnAudioPolicy::Buffer);
        assert_eq!(config.history_window, 20);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            history_window = 8
            mid_turn_audio = "reject"

            [vad]
            backend = "webrtc"
            mode = 3

            [audio.source_encoding]
            kind = "container"
            extension = "webm"
            "#,
        )
        .unwrap();
        assert_eq!(config.history_window, 8);
        assert_eq!(config.mid_turn_audio, MidTurnAudioPolicy::Reject);
        assert_eq!(config.vad, VadConfig::WebRtc { mode: 3 });
        assert_eq!(
            config.audio.source_encoding,
            SourceEncoding::Container {
                extension: "webm".into()
            }
        );
        assert_eq!(config.turn, TurnConfig::default());
        assert_eq!(config.synthesis_lookahead, 2);
    }

    #[test]
    fn lookahead_must_allow_overlap_and_stay_small() {
        for lookahead in [0, MAX_SYNTHESIS_LOOKAHEAD + 1] {
            let config = SessionConfig {
                synthesis_lookahead: lookahead,
                ..SessionConfig::default()
            };
            assert!(matches!(config.validate(), Err(VoiceError::Config(_))));
        }
        let config = SessionConfig {
            synthesis_lookahead: 1,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn webrtc_needs_a_supported_pcm_rate() {
        let mut config = SessionConfig {
            vad: VadConfig::WebRtc { mode: 2 },
            ..SessionConfig::default()
        };
        config.audio.source_encoding = SourceEncoding::Pcm16 {
            sample_rate: 44_100,
            channels: 1,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("44100"), "{}", err);

        config.audio.source_encoding = SourceEncoding::Pcm16 {
            sample_rate: 48_000,
            channels: 2,
        };
        assert!(config.validate().is_ok());

        // Energy gating works at any rate.
        config.vad = VadConfig::default();
        config.audio.source_encoding = SourceEncoding::Pcm16 {
            sample_rate: 44_100,
            channels: 1,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pre_roll_must_fit_inside_a_turn() {
        let mut config = SessionConfig::default();
        config.audio.max_turn_ms = 300;
        assert!(matches!(config.validate(), Err(VoiceError::Config(_))));
        config.turn.pre_roll_ms = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = SessionConfig {
            history_window: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(VoiceError::Config(_))));
    }
}
