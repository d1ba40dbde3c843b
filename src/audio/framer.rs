//! # Audio Capture Framer
//!
//! Microphone audio arrives in whatever chunk sizes the capture side produces
//! (a browser worklet posts 128-sample quanta, a script processor 4096). The
//! streaming endpoint wants one message per fixed-size frame, so the framer
//! accumulates samples and emits whole frames in capture order.
//!
//! Frames are emitted regardless of the session's mute flag; muting gates
//! frames *after* framing so downstream timing is preserved.

use crate::audio::AudioFrame;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Accumulates captured samples into fixed-length frames.
#[derive(Debug)]
pub struct AudioFramer {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    frames_emitted: u64,
}

impl AudioFramer {
    /// Create a framer emitting `frame_size` samples per frame.
    ///
    /// A zero frame size is treated as 1 so the framer never stalls.
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size),
            frames_emitted: 0,
        }
    }

    /// Feed captured samples; returns every frame completed by this chunk.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let wanted = self.frame_size - self.pending.len();
            let take = wanted.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                frames.push(AudioFrame::new(samples, self.sample_rate));
                self.frames_emitted += 1;
            }
        }

        frames
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Drop any partial frame, e.g. when the microphone is released.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Parse raw little-endian `f32` capture bytes (as posted by a browser
/// `Float32Array`) into samples.
pub fn samples_from_le_bytes(data: &[u8]) -> Result<Vec<f32>, String> {
    if data.is_empty() {
        return Err("No audio data provided".to_string());
    }
    if data.len() % 4 != 0 {
        return Err(format!(
            "Capture data length {} is not a whole number of f32 samples",
            data.len()
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        if !sample.is_finite() {
            return Err("Capture data contains a non-finite sample".to_string());
        }
        samples.push(sample);
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_fixed_size_and_ordered() {
        let mut framer = AudioFramer::new(4, 16_000);
        let first = framer.push(&[0.1, 0.2, 0.3]);
        assert!(first.is_empty());
        assert_eq!(framer.pending_len(), 3);

        let frames = framer.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(frames[1].sample_rate, 16_000);
        assert_eq!(framer.pending_len(), 1);
        assert_eq!(framer.frames_emitted(), 2);
    }

    #[test]
    fn test_large_chunk_spanning_many_frames() {
        let mut framer = AudioFramer::new(128, 16_000);
        let chunk = vec![0.0f32; 128 * 5 + 7];
        let frames = framer.push(&chunk);
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| f.samples.len() == 128));
        assert_eq!(framer.pending_len(), 7);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let mut framer = AudioFramer::new(8, 16_000);
        framer.push(&[0.5; 5]);
        framer.reset();
        assert_eq!(framer.pending_len(), 0);
        assert_eq!(framer.push(&[0.5; 8]).len(), 1);
    }

    #[test]
    fn test_samples_from_le_bytes() {
        let mut data = Vec::new();
        for s in [0.25f32, -0.5, 1.0] {
            data.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(samples_from_le_bytes(&data).unwrap(), vec![0.25, -0.5, 1.0]);

        assert!(samples_from_le_bytes(&[]).is_err());
        assert!(samples_from_le_bytes(&[0u8; 6]).is_err());
        assert!(samples_from_le_bytes(&f32::NAN.to_le_bytes()).is_err());
    }
}
