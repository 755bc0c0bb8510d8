//! # PCM Decoding
//!
//! Converts websocket binary payloads into 16-bit samples, and 16-bit samples into
//! the normalized float representation the Whisper model expects.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Sample rate every audio frame is assumed to use.
pub const SAMPLE_RATE: u32 = 16_000;

/// Reasons a binary payload cannot be read as PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcmError {
    /// Payload length is not a whole number of 16-bit samples
    OddLength(usize),
}

impl fmt::Display for PcmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PcmError::OddLength(len) => {
                write!(f, "audio payload of {} bytes is not a whole number of 16-bit samples", len)
            }
        }
    }
}

impl std::error::Error for PcmError {}

/// Decode a binary payload as signed 16-bit little-endian samples.
///
/// ## Returns:
/// - **Ok(Vec<i16>)**: One sample per two bytes (an empty payload yields no samples)
/// - **Err(PcmError)**: The payload has a trailing half sample
pub fn decode_pcm16le(data: &[u8]) -> Result<Vec<i16>, PcmError> {
    if data.len() % 2 != 0 {
        return Err(PcmError::OddLength(data.len()));
    }

    let mut samples = vec![0i16; data.len() / 2];
    LittleEndian::read_i16_into(data, &mut samples);
    Ok(samples)
}

/// Convert 16-bit PCM samples to 32-bit float format for ML models.
///
/// Scales from the 16-bit integer range [-32768, 32767] to [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}
