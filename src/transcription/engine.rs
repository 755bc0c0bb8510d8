//! # Whisper Recognition Engine
//!
//! Adapts [`WhisperModel`] to the streaming [`RecognitionEngine`] contract.
//!
//! Whisper decodes whole windows of audio rather than consuming samples
//! incrementally, so an open utterance is just a growing sample buffer. All of the
//! decoding cost lands in `finish`.

use super::model::WhisperModel;
use super::{RecognitionEngine, StreamHandle};
use crate::audio::{pcm_to_float, SAMPLE_RATE};
use crate::config::EngineConfig;
use crate::error::EngineError;
use anyhow::Result;
use std::collections::HashMap;

/// Audio collected for each open utterance, keyed by stream id.
#[derive(Debug, Default)]
pub struct UtteranceBuffers {
    next_id: u64,
    open: HashMap<u64, Vec<f32>>,
}

impl UtteranceBuffers {
    pub fn open(&mut self) -> StreamHandle {
        self.next_id += 1;
        self.open.insert(self.next_id, Vec::new());
        StreamHandle::new(self.next_id)
    }

    pub fn append(&mut self, stream: &StreamHandle, samples: &[i16]) -> Result<(), EngineError> {
        let buffer = self
            .open
            .get_mut(&stream.id())
            .ok_or_else(|| unknown_stream(stream))?;
        buffer.extend(pcm_to_float(samples));
        Ok(())
    }

    /// Remove and return the audio of an utterance.
    pub fn take(&mut self, stream: &StreamHandle) -> Result<Vec<f32>, EngineError> {
        self.open
            .remove(&stream.id())
            .ok_or_else(|| unknown_stream(stream))
    }
}

fn unknown_stream(stream: &StreamHandle) -> EngineError {
    EngineError::Utterance(format!("unknown stream {}", stream.id()))
}

/// The production engine: one Whisper model, one utterance at a time.
pub struct WhisperEngine {
    model: WhisperModel,
    buffers: UtteranceBuffers,
}

impl WhisperEngine {
    /// Load the model. Called once at startup; failure here stops the server.
    pub async fn load(config: &EngineConfig) -> Result<Self> {
        let model = WhisperModel::load(config).await?;
        Ok(Self {
            model,
            buffers: UtteranceBuffers::default(),
        })
    }
}

impl RecognitionEngine for WhisperEngine {
    fn open_utterance(&mut self) -> Result<StreamHandle, EngineError> {
        Ok(self.buffers.open())
    }

    fn feed(&mut self, stream: &StreamHandle, samples: &[i16]) -> Result<(), EngineError> {
        self.buffers.append(stream, samples)
    }

    fn finish(&mut self, stream: StreamHandle) -> Result<String, EngineError> {
        let audio = self.buffers.take(&stream)?;
        if audio.is_empty() {
            return Ok(String::new());
        }

        tracing::debug!(
            stream = stream.id(),
            seconds = audio.len() as f64 / SAMPLE_RATE as f64,
            "decoding utterance"
        );
        // Tensor errors are tied to this input; the model itself is left intact.
        self.model
            .transcribe(&audio)
            .map_err(|e| EngineError::Utterance(e.to_string()))
    }

    fn abort(&mut self, stream: StreamHandle) {
        let _ = self.buffers.take(&stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_collect_audio_per_stream() {
        let mut buffers = UtteranceBuffers::default();
        let first = buffers.open();
        let second = buffers.open();
        assert_ne!(first, second);

        buffers.append(&first, &[16384, -16384]).unwrap();
        buffers.append(&first, &[0]).unwrap();
        buffers.append(&second, &[32767]).unwrap();

        assert_eq!(buffers.take(&first).unwrap(), vec![0.5, -0.5, 0.0]);
        assert_eq!(buffers.open.len(), 1);
        assert_eq!(buffers.take(&second).unwrap().len(), 1);
        assert!(buffers.open.is_empty());
    }

    #[test]
    fn test_unknown_stream_is_recoverable() {
        let mut buffers = UtteranceBuffers::default();
        let stream = buffers.open();
        buffers.take(&stream).unwrap();

        let err = buffers.append(&stream, &[1]).unwrap_err();
        assert!(!err.is_fatal());
        assert!(buffers.take(&stream).is_err());
    }
}
