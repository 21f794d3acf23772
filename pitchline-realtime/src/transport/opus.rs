//! Opus codec for the negotiated-media transport.

use audiopus::coder::{Decoder, Encoder};
use audiopus::packet::Packet;
use audiopus::{Application, Channels, MutSignals, SampleRate};

use crate::error::{RealtimeError, Result};

/// Samples per 20ms Opus frame at 24kHz.
pub const OPUS_FRAME_SAMPLES: usize = 480;

// Opus packets never exceed 1275 bytes per frame; leave room for
// multi-frame packets.
const PACKET_CAPACITY: usize = 4000;

// Longest decodable packet is 120ms, i.e. 5760 samples at 48kHz.
const DECODE_CAPACITY: usize = 5760;

/// Mono PCM16 encoder and decoder sharing one sample rate.
pub struct OpusCodec {
    encoder: Encoder,
    decoder: Decoder,
    packet: Vec<u8>,
    pcm: Vec<i16>,
}

impl OpusCodec {
    /// Codec at `sample_rate`: 8000, 12000, 16000, 24000 or 48000 Hz.
    pub fn new(sample_rate: u32) -> Result<Self> {
        let rate = i32::try_from(sample_rate)
            .ok()
            .and_then(|hz| SampleRate::try_from(hz).ok())
            .ok_or_else(|| RealtimeError::opus(format!("{sample_rate} Hz is not an Opus rate")))?;
        let encoder = Encoder::new(rate, Channels::Mono, Application::Voip)
            .map_err(|e| RealtimeError::opus(format!("encoder init: {e}")))?;
        let decoder = Decoder::new(rate, Channels::Mono)
            .map_err(|e| RealtimeError::opus(format!("decoder init: {e}")))?;
        Ok(Self {
            encoder,
            decoder,
            packet: vec![0; PACKET_CAPACITY],
            pcm: vec![0; DECODE_CAPACITY],
        })
    }

    /// Encode exactly one frame (120, 240, 480, 960, 1920 or 2880 samples
    /// at 24kHz) into a packet.
    pub fn encode(&mut self, frame: &[i16]) -> Result<Vec<u8>> {
        let len = self
            .encoder
            .encode(frame, &mut self.packet)
            .map_err(|e| RealtimeError::opus(format!("encode {} samples: {e}", frame.len())))?;
        Ok(self.packet[..len].to_vec())
    }

    /// Decode one packet into PCM16 samples.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let packet = Packet::try_from(packet)
            .map_err(|e| RealtimeError::opus(format!("bad packet: {e}")))?;
        let out = MutSignals::try_from(self.pcm.as_mut_slice())
            .map_err(|e| RealtimeError::opus(format!("decode buffer: {e}")))?;
        let len = self
            .decoder
            .decode(Some(packet), out, false)
            .map_err(|e| RealtimeError::opus(format!("decode: {e}")))?;
        Ok(self.pcm[..len].to_vec())
    }
}
