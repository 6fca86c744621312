//! Dialogue history: ordered (role, text) entries, append-only for a session's life.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Conversation history for one session.
///
/// Stored entries are never reordered or edited. [`DialogueHistory::snapshot`] applies the
/// sliding window: only the most recent `window` entries are handed to the generator, and
/// the window is trimmed forward so it always opens on a user entry.
#[derive(Debug, Clone)]
pub struct DialogueHistory {
    entries: Vec<DialogueEntry>,
    window: usize,
}

impl DialogueHistory {
    pub fn new(window: usize) -> Self {
        Self {
            entries: Vec::new(),
            window: window.max(1),
        }
    }

    pub fn append(&mut self, role: Role, text: impl Into<String>) {
        self.entries.push(DialogueEntry {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        });
    }

    /// Owned copy of the generator-visible window.
    pub fn snapshot(&self) -> Vec<DialogueEntry> {
        let start = self.entries.len().saturating_sub(self.window);
        let window = &self.entries[start..];
        let first_user = window
            .iter()
            .position(|e| e.role == Role::User)
            .unwrap_or(window.len());
        window[first_user..].to_vec()
    }

    /// Every entry ever appended, oldest first.
    pub fn entries(&self) -> &[DialogueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
