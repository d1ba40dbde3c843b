//! # Audio Codec
//!
//! Converts between float frames and the streaming endpoint's wire encoding:
//! base64 of little-endian 16-bit signed PCM, tagged with a MIME type such as
//! `audio/pcm;rate=16000`.
//!
//! Quantization uses a power-of-two scale (32768), so a decoded sample
//! re-encodes to exactly the same 16-bit value. No resampling happens here.

use crate::audio::AudioFrame;
use crate::error::ConsultationError;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

const PCM_SCALE: f32 = 32768.0;
const PCM_MIME: &str = "audio/pcm";

/// One encoded unit of audio as it travels in a network message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    pub mime_type: String,
    pub data: String,
}

/// Encoder/decoder bound to the session's outbound and inbound rates.
#[derive(Debug, Clone, Copy)]
pub struct AudioCodec {
    input_sample_rate: u32,
    output_sample_rate: u32,
}

impl AudioCodec {
    pub fn new(input_sample_rate: u32, output_sample_rate: u32) -> Self {
        Self {
            input_sample_rate,
            output_sample_rate,
        }
    }

    /// Quantize and base64-encode one captured frame.
    pub fn encode(&self, samples: &[f32]) -> AudioChunk {
        encode_pcm(samples, self.input_sample_rate)
    }

    /// Decode one inbound chunk into a playable frame.
    ///
    /// The rate comes from the chunk's MIME type when it carries one,
    /// otherwise the configured output rate is assumed.
    pub fn decode(&self, mime_type: &str, data: &str) -> Result<AudioFrame, ConsultationError> {
        let sample_rate = match parse_pcm_mime_type(mime_type)? {
            Some(rate) => rate,
            None => self.output_sample_rate,
        };

        let bytes = B64
            .decode(data)
            .map_err(|e| ConsultationError::Decode(format!("invalid base64: {}", e)))?;
        let samples = pcm_bytes_to_float(&bytes)?;
        Ok(AudioFrame::new(samples, sample_rate))
    }
}

/// Encode samples at an arbitrary rate, e.g. to relay decoded speech.
pub fn encode_pcm(samples: &[f32], sample_rate: u32) -> AudioChunk {
    AudioChunk {
        mime_type: pcm_mime_type(sample_rate),
        data: B64.encode(float_to_pcm_bytes(samples)),
    }
}

/// `audio/pcm;rate=<rate>`
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME, sample_rate)
}

/// Returns the `rate` parameter of a PCM MIME type, if present.
///
/// An empty MIME type is accepted as "unspecified"; anything that is not
/// raw PCM is a decode error.
fn parse_pcm_mime_type(mime_type: &str) -> Result<Option<u32>, ConsultationError> {
    let mime_type = mime_type.trim();
    if mime_type.is_empty() {
        return Ok(None);
    }

    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next().unwrap_or_default();
    if !essence.eq_ignore_ascii_case(PCM_MIME) && !essence.eq_ignore_ascii_case("audio/l16") {
        return Err(ConsultationError::Decode(format!(
            "unsupported audio mime type: {}",
            mime_type
        )));
    }

    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("rate") {
                let rate = value.trim().parse::<u32>().map_err(|_| {
                    ConsultationError::Decode(format!("invalid sample rate in {}", mime_type))
                })?;
                if rate == 0 {
                    return Err(ConsultationError::Decode("sample rate of 0".to_string()));
                }
                return Ok(Some(rate));
            }
        }
    }

    Ok(None)
}

/// Quantize a float in `[-1, 1]` to a 16-bit sample.
pub fn quantize(sample: f32) -> i16 {
    let scaled = sample * PCM_SCALE;
    scaled.clamp(-32768.0, 32767.0) as i16
}

pub fn dequantize(sample: i16) -> f32 {
    sample as f32 / PCM_SCALE
}

fn float_to_pcm_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(quantize(sample));
    }
    bytes
}

fn pcm_bytes_to_float(bytes: &[u8]) -> Result<Vec<f32>, ConsultationError> {
    if bytes.len() % 2 != 0 {
        return Err(ConsultationError::Decode(format!(
            "PCM payload of {} bytes is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(dequantize(sample));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> AudioCodec {
        AudioCodec::new(16_000, 24_000)
    }

    #[test]
    fn test_encode_tags_input_rate() {
        let chunk = codec().encode(&[0.0, 0.5, -0.5]);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        // 3 samples * 2 bytes = 6 bytes -> 8 base64 chars
        assert_eq!(chunk.data.len(), 8);
    }

    #[test]
    fn test_round_trip_is_exact_on_quantized_domain() {
        let original: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .chain([1.0, -1.0, 0.0, 1.5, -1.5])
            .collect();
        let quantized: Vec<f32> = original.iter().map(|&s| dequantize(quantize(s))).collect();

        let chunk = codec().encode(&original);
        let frame = codec().decode("audio/pcm;rate=16000", &chunk.data).unwrap();

        assert_eq!(frame.samples.len(), original.len());
        assert_eq!(frame.samples, quantized);

        let again = codec().encode(&frame.samples);
        assert_eq!(again.data, chunk.data);
    }

    #[test]
    fn test_quantize_clamps_full_scale() {
        assert_eq!(quantize(1.0), i16::MAX);
        assert_eq!(quantize(-1.0), i16::MIN);
        assert_eq!(quantize(3.0), i16::MAX);
        assert_eq!(quantize(0.0), 0);
    }

    #[test]
    fn test_decode_uses_default_output_rate() {
        let data = B64.encode([0u8, 0, 0xff, 0x7f]);
        let frame = codec().decode("", &data).unwrap();
        assert_eq!(frame.sample_rate, 24_000);
        assert_eq!(frame.samples.len(), 2);

        let frame = codec().decode("audio/pcm", &data).unwrap();
        assert_eq!(frame.sample_rate, 24_000);

        let frame = codec().decode("audio/pcm;rate=22050", &data).unwrap();
        assert_eq!(frame.sample_rate, 22_050);
    }

    #[test]
    fn test_decode_empty_payload_is_valid() {
        let frame = codec().decode("audio/pcm;rate=24000", "").unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        let odd = B64.encode([1u8, 2, 3]);
        assert!(matches!(
            codec().decode("audio/pcm;rate=24000", &odd),
            Err(ConsultationError::Decode(_))
        ));
        assert!(matches!(
            codec().decode("audio/pcm;rate=24000", "not base64!!"),
            Err(ConsultationError::Decode(_))
        ));
        assert!(matches!(
            codec().decode("audio/opus", &B64.encode([0u8, 0])),
            Err(ConsultationError::Decode(_))
        ));
    }
}
