//! Turn-taking: deciding when the user has finished speaking.
//!
//! A turn ends on either trigger:
//! - an explicit end marker from the client, or
//! - sustained silence of at least `silence_threshold_ms` after at least one chunk was
//!   classified as speech ("gap logic"). The boundary is inclusive: trailing silence equal
//!   to the threshold ends the turn, so with 100 ms chunks and an 800 ms threshold the
//!   eighth silent chunk is the one that triggers.
//!
//! Silence is measured in audio time (bytes / byte rate), not wall-clock time, so the
//! decision does not depend on network jitter.

use crate::format::{decode_pcm16_le, downmix, SourceEncoding};
use crate::vad::{Classification, VoiceActivityDetector};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for turn detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Silence after speech that ends a turn (default: 800ms).
    pub silence_threshold_ms: u64,

    /// Classifications kept per turn (default: 512).
    pub history_capacity: usize,

    /// Leading audio kept before the first speech chunk; older silence is dropped
    /// (default: 300ms).
    pub pre_roll_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 800,
            history_capacity: 512,
            pre_roll_ms: 300,
        }
    }
}

impl TurnConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn pre_roll(&self) -> Duration {
        Duration::from_millis(self.pre_roll_ms)
    }
}

/// One classified chunk and how much audio it covered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub classification: Classification,
    pub duration: Duration,
}

/// Rolling classifications for the current turn.
///
/// Older entries are evicted past `capacity`; whether speech was ever seen survives eviction.
#[derive(Debug, Clone)]
pub struct ClassificationHistory {
    observations: VecDeque<Observation>,
    capacity: usize,
    speech_seen: bool,
}

impl ClassificationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            observations: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            speech_seen: false,
        }
    }

    pub fn push(&mut self, observation: Observation) {
        if observation.classification.is_speech() {
            self.speech_seen = true;
        }
        if self.observations.len() == self.capacity {
            self.observations.pop_front();
        }
        self.observations.push_back(observation);
    }

    pub fn speech_seen(&self) -> bool {
        self.speech_seen
    }

    /// Silence accumulated since the most recent speech observation.
    pub fn trailing_silence(&self) -> Duration {
        self.observations
            .iter()
            .rev()
            .take_while(|o| !o.classification.is_speech())
            .map(|o| o.duration)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.speech_seen = false;
    }
}

/// Decide whether the turn is over. Silence ends it once `silence >= silence_threshold`.
pub fn should_end_turn(
    history: &ClassificationHistory,
    explicit_end: bool,
    silence_threshold: Duration,
) -> bool {
    if explicit_end {
        return true;
    }
    if !history.speech_seen() {
        return false;
    }
    let silence = history.trailing_silence();
    silence > Duration::ZERO && silence >= silence_threshold
}

/// Per-session turn detector: classifies inbound chunks and tracks the gap.
pub struct TurnDetector {
    config: TurnConfig,
    encoding: SourceEncoding,
    vad: Box<dyn VoiceActivityDetector>,
    history: ClassificationHistory,
}

impl TurnDetector {
    pub fn new(
        config: TurnConfig,
        vad: Box<dyn VoiceActivityDetector>,
        encoding: SourceEncoding,
    ) -> Self {
        let history = ClassificationHistory::new(config.history_capacity);
        Self {
            config,
            encoding,
            vad,
            history,
        }
    }

    /// Classify a raw inbound chunk. Classifier errors count as speech so audio is never
    /// silently dropped.
    ///
    /// Encoded streams (WAV, containers) cannot be decoded chunk by chunk; they are always
    /// treated as speech, leaving the end marker and buffer limit as the only triggers.
    pub fn classify(&mut self, chunk: &[u8]) -> Classification {
        let (sample_rate, channels) = match self.encoding {
            SourceEncoding::Pcm16 {
                sample_rate,
                channels,
            } => (sample_rate, channels),
            _ => return Classification::Speech,
        };
        let pcm = downmix(&decode_pcm16_le(chunk), channels);
        match self.vad.classify(&pcm, sample_rate) {
            Ok(c) => c,
            Err(e) => {
                warn!(target: "parley::turn", "VAD ({}) failed, treating chunk as speech: {}", self.vad.name(), e);
                Classification::Speech
            }
        }
    }

    /// Record a chunk and report whether it ends the turn by silence.
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        let classification = self.classify(chunk);
        let duration = self.encoding.duration_of(chunk.len()).unwrap_or_default();
        self.history.push(Observation {
            classification,
            duration,
        });
        let ended = self.should_end_turn(false);
        if ended {
            debug!(
                target: "parley::turn",
                "Silence threshold reached ({:?}), ending turn",
                self.history.trailing_silence()
            );
        }
        ended
    }

    pub fn should_end_turn(&self, explicit_end: bool) -> bool {
        should_end_turn(&self.history, explicit_end, self.config.silence_threshold())
    }

    pub fn speech_seen(&self) -> bool {
        self.history.speech_seen()
    }

    pub fn history(&self) -> &ClassificationHistory {
        &self.history
    }

    /// Reset alongside the audio buffer.
    pub fn reset(&mut self) {
        self.history.clear();
        self.vad.reset();
    }

    /// Get the current state (for logging/debugging)
    pub fn state(&self) -> &'static str {
        if self.history.is_empty() {
            "idle"
        } else if self.history.speech_seen() && self.history.trailing_silence() > Duration::ZERO {
            "silence_detected"
        } else if self.history.speech_seen() {
            "speaking"
        } else {
            "waiting_for_speech"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{VoiceError, VoiceResult};
    use crate::vad::EnergyVad;

    const CHUNK_MS: u64 = 100;

    fn obs(c: Classification) -> Observation {
        Observation {
            classification: c,
            duration: Duration::from_millis(CHUNK_MS),
        }
    }

    /// 100ms of 16kHz mono PCM16 at the given amplitude.
    fn chunk(amplitude: i16) -> Vec<u8> {
        (0..1600)
            .flat_map(|i| {
                let v = if i % 2 == 0 { amplitude } else { -amplitude };
                v.to_le_bytes()
            })
            .collect()
    }

    fn detector(threshold_ms: u64) -> TurnDetector {
        let config = TurnConfig {
            silence_threshold_ms: threshold_ms,
            ..Default::default()
        };
        TurnDetector::new(
            config,
            Box::new(EnergyVad::new(0.015).unwrap()),
            SourceEncoding::default(),
        )
    }

    #[test]
    fn silence_ends_turn_exactly_when_threshold_is_reached() {
        let threshold = Duration::from_millis(500);
        let mut history = ClassificationHistory::new(64);
        history.push(obs(Classification::Speech));
        for i in 1..=5 {
            assert!(
                !should_end_turn(&history, false, threshold),
                "ended early after {} silent chunks",
                i - 1
            );
            history.push(obs(Classification::Silence));
        }
        assert!(should_end_turn(&history, false, threshold));
    }

    #[test]
    fn silence_without_speech_never_ends_turn() {
        let mut history = ClassificationHistory::new(64);
        for _ in 0..50 {
            history.push(obs(Classification::Silence));
        }
        assert!(!should_end_turn(&history, false, Duration::from_millis(300)));
    }

    #[test]
    fn explicit_end_always_ends_turn() {
        let history = ClassificationHistory::new(8);
        assert!(should_end_turn(&history, true, Duration::from_secs(10)));
    }

    #[test]
    fn renewed_speech_resets_the_gap() {
        let threshold = Duration::from_millis(300);
        let mut history = ClassificationHistory::new(64);
        history.push(obs(Classification::Speech));
        history.push(obs(Classification::Silence));
        history.push(obs(Classification::Silence));
        history.push(obs(Classification::Speech));
        history.push(obs(Classification::Silence));
        assert_eq!(history.trailing_silence(), Duration::from_millis(100));
        assert!(!should_end_turn(&history, false, threshold));
    }

    #[test]
    fn speech_seen_survives_eviction() {
        let mut history = ClassificationHistory::new(2);
        history.push(obs(Classification::Speech));
        history.push(obs(Classification::Silence));
        history.push(obs(Classification::Silence));
        assert_eq!(history.len(), 2);
        assert!(history.speech_seen());
        assert!(should_end_turn(&history, false, Duration::from_millis(200)));
    }

    #[test]
    fn detector_ends_turn_on_pcm_gap() {
        let mut det = detector(300);
        assert!(!det.observe(&chunk(8000)));
        assert_eq!(det.state(), "speaking");
        assert!(!det.observe(&chunk(0)));
        assert!(!det.observe(&chunk(0)));
        assert_eq!(det.state(), "silence_detected");
        assert!(det.observe(&chunk(0)));

        det.reset();
        assert_eq!(det.state(), "idle");
        assert!(!det.speech_seen());
    }

    struct FailingVad;

    impl VoiceActivityDetector for FailingVad {
        fn classify(&mut self, _pcm: &[f32], _sample_rate: u32) -> VoiceResult<Classification> {
            Err(VoiceError::Ingest("model unavailable".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn classifier_errors_fail_open_to_speech() {
        let mut det = TurnDetector::new(
            TurnConfig::default(),
            Box::new(FailingVad),
            SourceEncoding::default(),
        );
        assert_eq!(det.classify(&chunk(0)), Classification::Speech);
    }

    #[test]
    fn encoded_streams_are_never_ended_by_silence() {
        let mut det = TurnDetector::new(
            TurnConfig {
                silence_threshold_ms: 1,
                ..Default::default()
            },
            Box::new(EnergyVad::new(0.015).unwrap()),
            SourceEncoding::Container {
                extension: "webm".into(),
            },
        );
        for _ in 0..10 {
            assert!(!det.observe(&chunk(0)));
        }
        assert!(det.speech_seen());
        assert!(det.should_end_turn(true));
    }
}
