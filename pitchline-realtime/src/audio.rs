//! Audio format definitions and the outbound/inbound sample codec.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};

/// Wire sample rate for both directions.
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples per outbound frame on the socket transport.
pub const DEFAULT_FRAME_SAMPLES: usize = 4096;

/// Audio encoding formats understood by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM.
    #[serde(rename = "pcm16")]
    #[default]
    Pcm16,
}

impl std::fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pcm16 => write!(f, "pcm16"),
        }
    }
}

/// Encoding, rate and channel layout of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of audio channels.
    pub channels: u8,
    /// Sample encoding.
    pub encoding: AudioEncoding,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_24khz()
    }
}

impl AudioFormat {
    /// Mono PCM16 at 24kHz, the only format the bridge speaks.
    pub const fn pcm16_24khz() -> Self {
        Self { sample_rate: SAMPLE_RATE, channels: 1, encoding: AudioEncoding::Pcm16 }
    }

    /// Bytes per second for this format.
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.channels as u32 * 2
    }

    /// Duration in milliseconds of `samples` samples per channel.
    pub fn duration_ms(&self, samples: usize) -> f64 {
        samples as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// A block of signed 16-bit samples with its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Format of `samples`.
    pub format: AudioFormat,
    /// Interleaved samples.
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Create a 24kHz mono frame.
    pub fn new(samples: Vec<i16>) -> Self {
        Self { format: AudioFormat::pcm16_24khz(), samples }
    }

    /// A frame of `len` zero samples.
    pub fn silence(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// Encode floating-point samples into a frame.
    pub fn from_f32(samples: &[f32]) -> Self {
        Self::new(encode_samples(samples))
    }

    /// Number of samples in the frame.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if the frame carries no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.format.duration_ms(self.samples.len() / self.format.channels.max(1) as usize)
    }

    /// PCM16 little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        data
    }

    /// Parse PCM16 little-endian bytes.
    pub fn from_le_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % 2 != 0 {
            return Err(RealtimeError::media(format!(
                "Invalid data length for PCM16: {} (must be even)",
                data.len()
            )));
        }
        let samples = data.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
        Ok(Self::new(samples))
    }

    /// Encode the frame as base64 PCM16.
    pub fn to_base64(&self) -> String {
        encode_base64(&self.to_le_bytes())
    }

    /// Decode a base64 PCM16 payload.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        Self::from_le_bytes(&decode_base64(encoded)?)
    }
}

/// Encode one floating-point sample: scale by 32768, truncate toward zero,
/// then clamp into the i16 range.
#[inline]
pub fn encode_sample(x: f32) -> i16 {
    (x * 32768.0).trunc().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode a slice of floating-point samples.
pub fn encode_samples(samples: &[f32]) -> Vec<i16> {
    samples.iter().copied().map(encode_sample).collect()
}

/// Standard base64 encoding.
pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Standard base64 decoding.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| RealtimeError::media(format!("base64 decode failed: {e}")))
}

/// Groups captured samples into fixed-size frames.
///
/// Capture callbacks deliver blocks of arbitrary length. The socket transport
/// needs frames of exactly `frame_samples`, so samples accumulate here until a
/// full frame is available.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    buffer: Vec<i16>,
    frame_samples: usize,
}

impl FrameAssembler {
    /// Create an assembler emitting frames of `frame_samples` samples.
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self { buffer: Vec::with_capacity(frame_samples), frame_samples }
    }

    /// Frame size in samples.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Samples waiting for a full frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Encode and push floating-point samples.
    pub fn push_f32(&mut self, samples: &[f32]) {
        self.buffer.extend(samples.iter().copied().map(encode_sample));
    }

    /// Push already-encoded samples.
    pub fn push(&mut self, samples: &[i16]) {
        self.buffer.extend_from_slice(samples);
    }

    /// Pop the next full frame, if any.
    pub fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.buffer.len() < self.frame_samples {
            return None;
        }
        let rest = self.buffer.split_off(self.frame_samples);
        let frame = std::mem::replace(&mut self.buffer, rest);
        Some(AudioFrame::new(frame))
    }

    /// Flush any remaining samples as a short frame.
    pub fn flush_remaining(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(AudioFrame::new(std::mem::take(&mut self.buffer)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sample_edges() {
        assert_eq!(encode_sample(0.0), 0);
        assert_eq!(encode_sample(1.0), 32767);
        assert_eq!(encode_sample(-1.0), -32768);
        assert_eq!(encode_sample(0.5), 16384);
        // truncation, not rounding
        assert_eq!(encode_sample(0.99999), 32767);
        assert_eq!(encode_sample(-0.000_02), 0);
        assert_eq!(encode_sample(1.0 / 32768.0 * 1.9), 1);
        assert_eq!(encode_sample(-1.0 / 32768.0 * 1.9), -1);
    }

    #[test]
    fn test_encode_sample_out_of_range_clamps() {
        assert_eq!(encode_sample(2.0), 32767);
        assert_eq!(encode_sample(-3.5), -32768);
    }

    #[test]
    fn test_frame_assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::new(4);
        assembler.push(&[1, 2, 3]);
        assert!(assembler.next_frame().is_none());

        assembler.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(assembler.next_frame().unwrap().samples, vec![1, 2, 3, 4]);
        assert_eq!(assembler.next_frame().unwrap().samples, vec![5, 6, 7, 8]);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.pending(), 1);

        assert_eq!(assembler.flush_remaining().unwrap().samples, vec![9]);
        assert!(assembler.flush_remaining().is_none());
    }

    #[test]
    fn test_frame_base64() {
        let frame = AudioFrame::new(vec![0, 1, -1, i16::MAX, i16::MIN]);
        let decoded = AudioFrame::from_base64(&frame.to_base64()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_odd_bytes_rejected() {
        let err = AudioFrame::from_le_bytes(&[0, 1, 2]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Media);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::silence(DEFAULT_FRAME_SAMPLES);
        let expected = 4096.0 * 1000.0 / 24000.0;
        assert!((frame.duration_ms() - expected).abs() < 1e-9);
        assert_eq!(AudioFormat::pcm16_24khz().bytes_per_second(), 48000);
    }
}
