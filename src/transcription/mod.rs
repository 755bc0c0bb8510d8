//! # Transcription Module
//!
//! The recognition engine contract the session layer drives, plus the Whisper
//! implementation built on Candle-rs.
//!
//! ## Engine Contract:
//! An engine is stateful and non-reentrant. The session layer only ever reaches it
//! through an [`EnginePermit`](crate::session::gate::EnginePermit), so at most one
//! utterance is in flight at any time and no method is ever called concurrently.
//!
//! ## Utterance Lifecycle:
//! 1. `open_utterance` allocates decoder state and returns a [`StreamHandle`]
//! 2. `feed` appends audio, any number of times
//! 3. `finish` consumes the handle and returns the best transcript, or
//!    `abort` consumes the handle and discards the state

pub mod model;       // Whisper model loading and decoding
pub mod engine;      // RecognitionEngine implementation over WhisperModel

#[cfg(test)]
pub mod testing;     // Scripted engine used by session and transport tests

use crate::error::EngineError;

pub use engine::WhisperEngine;

/// Opaque per-utterance decoder state owned by the session for the utterance's duration.
///
/// Deliberately neither `Clone` nor `Copy`: `finish` and `abort` take it by value, so
/// a handle cannot be used after the engine has invalidated it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    /// Engines mint handles from their own identifiers.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Capability set the session layer needs from a recognizer.
///
/// Never called concurrently. `open_utterance`, `feed` and `finish` run on the
/// blocking thread pool; `abort` may run on an async worker and must be cheap.
pub trait RecognitionEngine: Send {
    /// Allocate decoder state for a new utterance.
    fn open_utterance(&mut self) -> Result<StreamHandle, EngineError>;

    /// Append 16-bit mono samples to an open utterance.
    fn feed(&mut self, stream: &StreamHandle, samples: &[i16]) -> Result<(), EngineError>;

    /// Finalize decoding and return the best hypothesis.
    ///
    /// Consumes the handle whether or not decoding succeeds; on failure the engine
    /// discards the utterance state exactly as `abort` would.
    fn finish(&mut self, stream: StreamHandle) -> Result<String, EngineError>;

    /// Discard in-progress decoder state without producing a transcript. Infallible.
    fn abort(&mut self, stream: StreamHandle);
}
