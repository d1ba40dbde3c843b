//! # Transcript Assembler
//!
//! Merges incremental speech-to-text fragments (user) and speech-source text
//! fragments (assistant) into message turns.
//!
//! ## Rules:
//! - Consecutive fragments of the same role are appended verbatim to the open
//!   message; no separators are inserted.
//! - A fragment flagged final closes the open message of its role.
//! - A fragment of the other role force-closes the open message first. This
//!   is how a barge-in shows up in the transcript.
//! - An empty final fragment creates nothing but still closes.
//! - Fragments are never reordered.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Speaker,
    pub text: String,
}

/// Finite-state accumulator: closed messages plus at most one open message.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    closed: Vec<TranscriptMessage>,
    open: Option<TranscriptMessage>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fragment in arrival order.
    pub fn push(&mut self, role: Speaker, text: &str, is_final: bool) {
        if self.open.as_ref().is_some_and(|open| open.role != role) {
            self.close_open();
        }

        match self.open.as_mut() {
            Some(open) => open.text.push_str(text),
            None if !text.is_empty() => {
                self.open = Some(TranscriptMessage {
                    role,
                    text: text.to_string(),
                });
            }
            None => {}
        }

        if is_final {
            self.close_open();
        }
    }

    /// Append a message that is complete on arrival, such as a typed reply.
    /// Whatever was open is closed first so the typed turn stands alone.
    pub fn push_complete(&mut self, role: Speaker, text: &str) {
        self.close_open();
        if !text.is_empty() {
            self.closed.push(TranscriptMessage {
                role,
                text: text.to_string(),
            });
        }
    }

    /// Close the open message of `role`, if there is one.
    pub fn finalize(&mut self, role: Speaker) {
        if self.open.as_ref().is_some_and(|open| open.role == role) {
            self.close_open();
        }
    }

    /// Close whatever is open; used when the session ends.
    pub fn finish(&mut self) -> &[TranscriptMessage] {
        self.close_open();
        &self.closed
    }

    #[cfg(test)]
    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.closed
    }

    pub fn open_message(&self) -> Option<&TranscriptMessage> {
        self.open.as_ref()
    }

    fn close_open(&mut self) {
        if let Some(message) = self.open.take() {
            self.closed.push(message);
        }
    }
}
