//! Scripted engine that records every call, for exercising the session layer
//! without loading a model.

use super::{RecognitionEngine, StreamHandle};
use crate::error::EngineError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One observed engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Open(u64),
    Feed(u64, Vec<i16>),
    Finish(u64),
    Abort(u64),
}

/// Shared view of what the engine saw, readable after the engine moved into a gate.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    peak_open: Arc<Mutex<usize>>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls made on behalf of one stream, in order.
    pub fn calls_for(&self, stream: u64) -> Vec<EngineCall> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                EngineCall::Open(id)
                | EngineCall::Feed(id, _)
                | EngineCall::Finish(id)
                | EngineCall::Abort(id) => *id == stream,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    /// Highest number of simultaneously open utterances ever observed.
    pub fn peak_open(&self) -> usize {
        *self.peak_open.lock().unwrap()
    }

    fn push(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Engine whose transcript and failures are chosen by the test.
///
/// The default transcript for an utterance is `"<n> samples"`.
pub struct ScriptedEngine {
    log: CallLog,
    next_id: u64,
    open: HashMap<u64, usize>,
    transcript: Option<String>,
    fail_feed: Option<EngineError>,
    fail_finish: Option<EngineError>,
    panic_on_finish: bool,
    feed_delay: Duration,
}

impl ScriptedEngine {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            next_id: 1,
            open: HashMap::new(),
            transcript: None,
            fail_feed: None,
            fail_finish: None,
            panic_on_finish: false,
            feed_delay: Duration::ZERO,
        }
    }

    pub fn with_transcript(mut self, text: &str) -> Self {
        self.transcript = Some(text.to_string());
        self
    }

    /// Fail the next `feed` call with `err`.
    pub fn failing_feed(mut self, err: EngineError) -> Self {
        self.fail_feed = Some(err);
        self
    }

    /// Fail the next `finish` call with `err`.
    pub fn failing_finish(mut self, err: EngineError) -> Self {
        self.fail_finish = Some(err);
        self
    }

    pub fn panicking_finish(mut self) -> Self {
        self.panic_on_finish = true;
        self
    }

    /// Sleep inside every `feed`, widening the window for overlapping sessions.
    pub fn with_feed_delay(mut self, delay: Duration) -> Self {
        self.feed_delay = delay;
        self
    }

    fn close(&mut self, id: u64) -> Result<usize, EngineError> {
        self.open
            .remove(&id)
            .ok_or_else(|| EngineError::Utterance(format!("unknown stream {}", id)))
    }
}

impl RecognitionEngine for ScriptedEngine {
    fn open_utterance(&mut self) -> Result<StreamHandle, EngineError> {
        let id = self.next_id;
        self.next_id += 1;
        self.open.insert(id, 0);
        self.log.push(EngineCall::Open(id));

        let mut peak = self.log.peak_open.lock().unwrap();
        *peak = (*peak).max(self.open.len());

        Ok(StreamHandle::new(id))
    }

    fn feed(&mut self, stream: &StreamHandle, samples: &[i16]) -> Result<(), EngineError> {
        self.log.push(EngineCall::Feed(stream.id(), samples.to_vec()));
        if !self.feed_delay.is_zero() {
            std::thread::sleep(self.feed_delay);
        }
        if let Some(err) = self.fail_feed.take() {
            return Err(err);
        }

        match self.open.get_mut(&stream.id()) {
            Some(total) => {
                *total += samples.len();
                Ok(())
            }
            None => Err(EngineError::Utterance(format!("unknown stream {}", stream.id()))),
        }
    }

    fn finish(&mut self, stream: StreamHandle) -> Result<String, EngineError> {
        self.log.push(EngineCall::Finish(stream.id()));
        if self.panic_on_finish {
            panic!("decoder crashed");
        }
        let total = self.close(stream.id())?;
        if let Some(err) = self.fail_finish.take() {
            return Err(err);
        }
        Ok(self
            .transcript
            .clone()
            .unwrap_or_else(|| format!("{} samples", total)))
    }

    fn abort(&mut self, stream: StreamHandle) {
        self.log.push(EngineCall::Abort(stream.id()));
        self.open.remove(&stream.id());
    }
}
