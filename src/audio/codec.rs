//! Conversion between f32 samples and the 16-bit little-endian PCM wire format.
//!
//! Capture runs at [`INPUT_SAMPLE_RATE`] and playback at [`OUTPUT_SAMPLE_RATE`].
//! The two pipelines are independent; nothing here resamples.

use base64::Engine as _;
use base64::engine::general_purpose;

use crate::protocol::models::Blob;
use crate::{Error, Result};

pub const INPUT_SAMPLE_RATE: u32 = 16_000;
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

const PCM16_SCALE_OUT: f32 = 32_767.0;
const PCM16_SCALE_IN: f32 = 32_768.0;

/// Mono PCM audio at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Playback length in seconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[must_use]
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Convert samples to 16-bit little-endian PCM bytes, clamping to [-1, 1].
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let value = (clamped * PCM16_SCALE_OUT).round() as i16;
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

/// Convert 16-bit little-endian PCM bytes back to samples.
///
/// # Errors
/// Returns an error if the payload has an odd number of bytes.
#[allow(clippy::result_large_err)]
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidAudio(format!(
            "pcm16 payload has odd length ({} bytes)",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / PCM16_SCALE_IN)
        .collect())
}

/// Encode one captured frame as a base64 media blob.
#[must_use]
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> Blob {
    Blob {
        mime_type: pcm_mime_type(sample_rate),
        data: general_purpose::STANDARD.encode(encode_pcm16(samples)),
    }
}

/// Decode a base64 PCM16 payload into a playback buffer at [`OUTPUT_SAMPLE_RATE`].
///
/// # Errors
/// Returns an error if the payload is not valid base64 or not whole 16-bit samples.
#[allow(clippy::result_large_err)]
pub fn decode_payload(data: &str) -> Result<PcmBuffer> {
    let bytes = general_purpose::STANDARD.decode(data.as_bytes())?;
    let samples = decode_pcm16(&bytes)?;
    Ok(PcmBuffer::new(samples, OUTPUT_SAMPLE_RATE))
}
