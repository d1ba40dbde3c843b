//! # Voice Consultation Session
//!
//! A consultation is one live, bidirectional conversation between a pet owner
//! and the intake assistant. Microphone audio flows out, synthesized speech
//! and transcripts flow back, and the assistant calls tools to look up pets
//! and doctors until it can hand a [`ConsultationResult`] to the booking flow.
//!
//! ## Components:
//! - `controller`: the `SessionController` owning the connection lifecycle
//! - `microphone`: the capture seam and the relay used by the browser bridge
//!
//! ## State machine:
//! ```text
//! Idle -> Connecting -> Open -> Closed
//!            |           |
//!            +-----------+--> Errored
//! ```
//! There is no automatic reconnection. A closed controller stays closed; the
//! caller retries by building a new one.

pub mod controller;
pub mod microphone;

pub use controller::SessionController;
pub use microphone::{Microphone, RelayMicrophone};

use crate::audio::playback::ScheduledPlayback;
use crate::audio::AudioFrame;
use crate::error::ConsultationError;
use crate::tools::ConsultationResult;
use serde::Serialize;
use std::time::Duration;

/// Per-session settings derived from the application config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub handshake_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    /// Closed and Errored are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// A decoded assistant buffer and where it belongs on the playback timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackAudio {
    pub frame: AudioFrame,
    pub schedule: ScheduledPlayback,
}

/// Outbound notifications from a session to its UI.
///
/// Injected at construction. Callbacks are invoked from the session's task,
/// one at a time and in event order; they must not block.
pub trait SessionCallbacks: Send + Sync {
    fn on_connection_change(&self, connected: bool);
    fn on_assistant_text(&self, text: &str, is_final: bool);
    /// User speech is always partial; finality is implied by a role switch.
    fn on_user_text(&self, text: &str);
    fn on_audio(&self, audio: &PlaybackAudio);
    fn on_complete(&self, result: ConsultationResult);
    fn on_error(&self, error: &ConsultationError);
    fn on_interrupted(&self);
}

/// Counters for one session, read when the session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_muted: u64,
    pub audio_chunks_played: u64,
    pub audio_chunks_dropped: u64,
    pub tool_calls: u64,
    pub tool_failures: u64,
    /// Assistant buffers that arrived after the previous one finished playing
    pub audio_underruns: u64,
}
