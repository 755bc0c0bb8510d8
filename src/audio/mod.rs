//! # Audio Processing Module
//!
//! Turns raw client audio into what the recognizer consumes.
//!
//! ## Components:
//! - **pcm**: Decodes s16le PCM frames into samples and float audio
//! - **mel**: Mel filterbank for Whisper's log-mel front end

pub mod pcm;
pub mod mel;

pub use pcm::{decode_pcm16le, pcm_to_float, SAMPLE_RATE};
