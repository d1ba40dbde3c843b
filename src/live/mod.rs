//! # Live Endpoint
//!
//! Client side of the bidirectional speech/LLM streaming service. The service
//! accepts microphone audio and typed turns, and answers with synthesized
//! speech, transcripts of both speakers and function calls.
//!
//! - `protocol`: JSON message types and their flattening into ordered events
//! - `transport`: the `LiveConnector` seam and its WebSocket implementation

pub mod protocol;
pub mod transport;

pub use protocol::{ClientMessage, FunctionCall, ServerEvent, ServerMessage, Setup};
pub use transport::{GeminiLiveConnector, LiveConnector, LiveLink};

/// WebSocket URL of the Gemini Live bidirectional endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used when none is configured.
pub const DEFAULT_MODEL: &str = "models/gemini-live-2.5-flash-native-audio";

/// Prebuilt voices accepted in `speechConfig`.
pub const VOICES: &[&str] = &["Puck", "Charon", "Kore", "Fenrir", "Aoede"];
