//! # Consultation Audio Pipeline
//!
//! Everything between the microphone and the wire, and between the wire and
//! the speaker:
//!
//! - **framer**: chunks the live capture stream into fixed-size frames
//! - **codec**: float frames <-> base64 16-bit PCM tagged with a MIME type
//! - **playback**: gapless scheduling of decoded assistant speech
//!
//! ## Audio Format Requirements:
//! - **Outbound**: 16 kHz mono, `audio/pcm;rate=16000`
//! - **Inbound**: 24 kHz mono, `audio/pcm;rate=24000`
//! - **Encoding**: little-endian signed 16-bit integers, base64 on the wire

pub mod codec;
pub mod framer;
pub mod playback;

pub use codec::{encode_pcm, AudioChunk, AudioCodec};
pub use framer::AudioFramer;
pub use playback::PlaybackScheduler;

/// A buffer of floating-point samples in `[-1.0, 1.0]` at a known rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback length of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
