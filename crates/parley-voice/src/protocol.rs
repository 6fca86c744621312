//! Message framing between a session and its client.
//!
//! Inbound frames are already split by the transport into binary audio and text control
//! messages; outbound messages are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};

/// Explicit end-of-turn marker, accepted as a text frame or as a binary frame with exactly these bytes.
pub const END_MARKER: &str = "<END>";

/// Aborts the in-flight turn without closing the session.
pub const CANCEL_MARKER: &str = "<CANCEL>";

/// One inbound frame after transport decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Audio(Vec<u8>),
    EndOfTurn,
    Cancel,
    /// Unrecognized text; ignored by the session.
    Text(String),
}

impl ClientFrame {
    pub fn from_text(text: &str) -> Self {
        match text.trim() {
            END_MARKER => ClientFrame::EndOfTurn,
            CANCEL_MARKER => ClientFrame::Cancel,
            other => ClientFrame::Text(other.to_string()),
        }
    }

    pub fn from_binary(bytes: Vec<u8>) -> Self {
        if bytes == END_MARKER.as_bytes() {
            ClientFrame::EndOfTurn
        } else {
            ClientFrame::Audio(bytes)
        }
    }
}

/// Outbound message, serialized as `{"type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Advisory progress text.
    Status { text: String },
    Transcript { text: String },
    /// One synthesized sentence; `audio` is a base64 24 kHz mono WAV.
    Tts {
        sentence: String,
        ordinal: usize,
        audio: String,
    },
    TtsError { ordinal: usize, reason: String },
    /// Turn-fatal failure; always followed by `done`.
    Error { stage: String, reason: String },
    Done,
}

impl ServerMessage {
    pub fn status(text: impl Into<String>) -> Self {
        ServerMessage::Status { text: text.into() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
