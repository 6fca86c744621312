//! Error types for the Parley voice system

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// How far an error reaches: one sentence, the current turn, or the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Reported for a single sentence ordinal; the turn continues.
    Sentence,
    /// Aborts the turn; the session returns to `Idle`.
    Turn,
    /// Ends the session.
    Session,
}

/// Errors that can occur while orchestrating a voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Ingest error: {0}")]
    Ingest(String),

    #[error("Audio normalization error: {0}")]
    Normalization(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error (sentence {ordinal}): {reason}")]
    Synthesis { ordinal: usize, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A turn task died without reporting an outcome.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Scope of the error under the session's recovery policy.
    pub fn severity(&self) -> Severity {
        match self {
            VoiceError::Synthesis { .. } => Severity::Sentence,
            VoiceError::Transport(_) => Severity::Session,
            _ => Severity::Turn,
        }
    }

    /// Short stage label used in outbound `error` messages.
    pub fn stage(&self) -> &'static str {
        match self {
            VoiceError::Ingest(_) => "ingest",
            VoiceError::Normalization(_) => "normalization",
            VoiceError::Transcription(_) => "transcription",
            VoiceError::Generation(_) => "generation",
            VoiceError::Synthesis { .. } => "synthesis",
            VoiceError::Transport(_) => "transport",
            VoiceError::Cancelled(_) => "cancelled",
            VoiceError::Internal(_) => "internal",
            VoiceError::Config(_) => "config",
            VoiceError::Io(_) => "io",
        }
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Normalization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_recovery_policy() {
        let synth = VoiceError::Synthesis {
            ordinal: 1,
            reason: "voice unavailable".into(),
        };
        assert_eq!(synth.severity(), Severity::Sentence);
        assert_eq!(VoiceError::Transcription("x".into()).severity(), Severity::Turn);
        assert_eq!(VoiceError::Generation("x".into()).severity(), Severity::Turn);
        assert_eq!(VoiceError::Transport("closed".into()).severity(), Severity::Session);
        assert_eq!(VoiceError::Internal("panic".into()).severity(), Severity::Turn);
    }

    #[test]
    fn synthesis_error_names_the_ordinal() {
        let err = VoiceError::Synthesis {
            ordinal: 3,
            reason: "timeout".into(),
        };
        assert_eq!(err.to_string(), "Synthesis error (sentence 3): timeout");
        assert_eq!(err.stage(), "synthesis");
    }
}
