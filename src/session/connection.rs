//! # Connection Session
//!
//! Per-connection state machine driving the engine for one client.
//!
//! ## Transitions:
//! ```text
//! Idle      + AudioChunk           -> acquire gate, open, feed   -> Streaming
//! Streaming + AudioChunk           -> feed                       -> Streaming
//! Streaming + EndOfStream          -> finish, reply, release     -> Idle
//! Streaming + ConnectionTerminated -> abort, release              -> Closed
//! Idle      + EndOfStream          -> close (policy)             -> Closed
//! Idle      + ConnectionTerminated -> nothing                    -> Closed
//! Closed    + anything             -> ignored                    -> Closed
//! ```
//!
//! ## Holding the engine:
//! The gate permit and the stream handle live together in an [`Utterance`], which
//! only exists inside the `Streaming` phase or while an engine call is running.
//! Dropping an `Utterance` that still owns its handle aborts the handle and then
//! releases the gate, so an early return, a dropped connection or a cancelled task
//! cannot leak either one.
//!
//! Engine calls that decode (`open_utterance`, `feed`, `finish`) move the utterance
//! onto the blocking thread pool and get it back when the call returns.

use super::frame::{Frame, Termination};
use super::gate::EnginePermit;
use super::Outbound;
use crate::error::{EngineError, GateError, SessionError};
use crate::state::AppState;
use crate::transcription::StreamHandle;
use actix_web_actors::ws;
use std::mem;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Close frame descriptions must fit in a control frame (125 bytes, minus the code).
const MAX_CLOSE_DESCRIPTION: usize = 120;

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Finalizing,
    Closed,
}

enum Phase {
    Idle,
    Streaming(Utterance),
    Finalizing,
    Closed,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Streaming(_) => SessionState::Streaming,
            Phase::Finalizing => SessionState::Finalizing,
            Phase::Closed => SessionState::Closed,
        }
    }
}

/// One open utterance: the gate permit plus the engine stream it guards.
struct Utterance {
    permit: EnginePermit,
    stream: Option<StreamHandle>,
    started: Instant,
    chunks: usize,
    samples: usize,
}

impl Utterance {
    fn open(mut permit: EnginePermit) -> Result<Self, EngineError> {
        let opened = permit.open_utterance();
        let stream = poison_if_fatal(&permit, opened)?;
        Ok(Self {
            permit,
            stream: Some(stream),
            started: Instant::now(),
            chunks: 0,
            samples: 0,
        })
    }

    fn feed(&mut self, samples: &[i16]) -> Result<(), EngineError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| EngineError::Utterance("utterance already finished".into()))?;
        let fed = self.permit.feed(stream, samples);
        poison_if_fatal(&self.permit, fed)?;
        self.chunks += 1;
        self.samples += samples.len();
        Ok(())
    }

    /// Consumes the stream handle; the permit stays held until the utterance drops.
    fn finish(&mut self) -> Result<String, EngineError> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| EngineError::Utterance("utterance already finished".into()))?;
        let finished = self.permit.finish(stream);
        poison_if_fatal(&self.permit, finished)
    }
}

impl Drop for Utterance {
    fn drop(&mut self) {
        // During a panic the engine is not touched again; the permit poisons the gate.
        if std::thread::panicking() {
            return;
        }
        if let Some(stream) = self.stream.take() {
            debug!(
                session_id = %self.permit.session_id(),
                stream = stream.id(),
                chunks = self.chunks,
                "aborting utterance"
            );
            self.permit.abort(stream);
        }
    }
}

/// Poisons the gate before the permit can be released, so no waiter ever sees a broken engine.
fn poison_if_fatal<T>(permit: &EnginePermit, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(err) = &result {
        if err.is_fatal() {
            permit.poison(err.message());
        }
    }
    result
}

/// Run an engine call on the blocking pool. A panic inside it is a fatal engine failure.
async fn run_blocking<T, F>(call: F) -> Result<T, EngineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call).await.map_err(|err| {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|msg| msg.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            EngineError::Fatal(format!("engine call panicked: {}", message))
        } else {
            EngineError::Fatal("engine call cancelled".to_string())
        }
    })
}

/// State machine for a single websocket connection.
pub struct ConnectionSession {
    id: Uuid,
    phase: Phase,
    state: AppState,
    outbound: UnboundedSender<Outbound>,
    utterances_completed: u32,
}

impl ConnectionSession {
    pub fn new(id: Uuid, state: AppState, outbound: UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            phase: Phase::Idle,
            state,
            outbound,
            utterances_completed: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    pub fn utterances_completed(&self) -> u32 {
        self.utterances_completed
    }

    /// Apply one classified frame.
    ///
    /// Errors are reported to the client here; the returned error is for logging.
    /// A recoverable engine failure leaves the session `Idle`; anything else closes it.
    pub async fn handle(&mut self, frame: Frame) -> Result<(), SessionError> {
        let phase = mem::replace(&mut self.phase, Phase::Closed);
        let from = phase.state();

        let outcome = match (phase, frame) {
            (Phase::Closed, _) => Ok(Phase::Closed),
            // Finalizing completes within a single call; a frame can only meet it
            // if that call was cancelled, in which case the connection is gone.
            (Phase::Finalizing, _) => Ok(Phase::Closed),

            (Phase::Idle, Frame::AudioChunk(samples)) => {
                self.open(samples).await.map(Phase::Streaming)
            }
            (Phase::Idle, Frame::EndOfStream) => Err(SessionError::ProtocolViolation(
                "end of stream with no open utterance".to_string(),
            )),
            (Phase::Idle, Frame::ConnectionTerminated(reason)) => Err(terminated(reason)),

            (Phase::Streaming(utterance), Frame::AudioChunk(samples)) => {
                self.feed(utterance, samples).await.map(Phase::Streaming)
            }
            (Phase::Streaming(utterance), Frame::EndOfStream) => {
                self.phase = Phase::Finalizing;
                self.finalize(utterance).await.map(|()| Phase::Idle)
            }
            (Phase::Streaming(utterance), Frame::ConnectionTerminated(reason)) => {
                warn!(
                    session_id = %self.id,
                    chunks = utterance.chunks,
                    samples = utterance.samples,
                    reason = %reason,
                    "connection terminated mid-utterance, aborting"
                );
                drop(utterance);
                self.state.record_utterance_aborted();
                Err(terminated(reason))
            }
        };

        match outcome {
            Ok(next) => {
                if next.state() != from {
                    debug!(session_id = %self.id, from = ?from, to = ?next.state(), "session transition");
                }
                self.phase = next;
                Ok(())
            }
            Err(err) => {
                let delivered = self.report(&err);
                self.phase = if err.is_terminal() || !delivered {
                    Phase::Closed
                } else {
                    Phase::Idle
                };
                debug!(session_id = %self.id, from = ?from, to = ?self.state(), "session transition");
                Err(err)
            }
        }
    }

    async fn open(&mut self, samples: Vec<i16>) -> Result<Utterance, SessionError> {
        let (id, state) = (self.id, &self.state);
        let acquire = async move {
            match state.config.session.acquire_timeout() {
                Some(deadline) => state.gate.acquire_timeout(id, deadline).await,
                None => state.gate.acquire(id).await,
            }
        };

        // The transport drops its reply receiver when the connection goes away,
        // which takes this session out of the gate queue.
        let permit = tokio::select! {
            biased;
            permit = acquire => permit?,
            _ = self.outbound.closed() => {
                debug!(session_id = %self.id, "connection lost while waiting for the engine");
                return Err(SessionError::Terminated(Termination::StreamEnded));
            }
        };

        let utterance = run_blocking(move || {
            let mut utterance = Utterance::open(permit)?;
            utterance.feed(&samples)?;
            Ok::<_, EngineError>(utterance)
        })
        .await??;

        debug!(
            session_id = %self.id,
            stream = utterance.stream.as_ref().map(StreamHandle::id),
            "utterance opened"
        );
        Ok(utterance)
    }

    async fn feed(&mut self, mut utterance: Utterance, samples: Vec<i16>) -> Result<Utterance, SessionError> {
        // On failure the utterance drops on the blocking thread, aborting its stream.
        let utterance = run_blocking(move || utterance.feed(&samples).map(|()| utterance)).await??;
        Ok(utterance)
    }

    async fn finalize(&mut self, mut utterance: Utterance) -> Result<(), SessionError> {
        let end_of_stream = Instant::now();
        let (utterance, text) = run_blocking(move || {
            let text = utterance.finish();
            (utterance, text)
        })
        .await?;
        let text = text?;

        let total = utterance.started.elapsed();
        let after_end_of_stream = end_of_stream.elapsed();
        info!(
            session_id = %self.id,
            text = %text,
            chunks = utterance.chunks,
            samples = utterance.samples,
            total_ms = total.as_millis() as u64,
            post_eos_ms = after_end_of_stream.as_millis() as u64,
            "recognized"
        );

        // Reply first, then release the gate, whether or not the reply got through.
        let delivered = self.outbound.send(Outbound::Transcript(text)).is_ok();
        drop(utterance);

        if !delivered {
            return Err(SessionError::TransportFailure);
        }
        self.utterances_completed += 1;
        self.state.record_utterance_completed(total, after_end_of_stream);
        Ok(())
    }

    /// Tell the client what went wrong. Returns whether every reply was handed over.
    fn report(&self, err: &SessionError) -> bool {
        match err {
            SessionError::ProtocolViolation(reason) => {
                self.state.record_protocol_violation();
                self.send(Outbound::Close(Some(close_reason(ws::CloseCode::Policy, reason))))
            }
            SessionError::Terminated(_) => true,
            SessionError::TransportFailure => {
                self.state.record_transport_failure();
                false
            }
            SessionError::Engine(engine_err) => {
                self.state.record_utterance_failed();
                let reported = self.send(Outbound::Failure(engine_err.to_string()));
                if engine_err.is_fatal() {
                    self.state.gate.poison(engine_err.message());
                    self.send(Outbound::Close(Some(close_reason(
                        ws::CloseCode::Error,
                        "recognition engine unavailable",
                    ))))
                } else {
                    reported
                }
            }
            SessionError::GateUnavailable(gate_err) => {
                self.send(Outbound::Failure(gate_err.to_string()));
                let code = match gate_err {
                    GateError::Poisoned(_) => ws::CloseCode::Error,
                    GateError::Timeout(_) => ws::CloseCode::Again,
                };
                self.send(Outbound::Close(Some(close_reason(code, &gate_err.to_string()))))
            }
        }
    }

    fn send(&self, message: Outbound) -> bool {
        self.outbound.send(message).is_ok()
    }
}

fn terminated(reason: Termination) -> SessionError {
    if reason.is_protocol_violation() {
        SessionError::ProtocolViolation(reason.to_string())
    } else {
        SessionError::Terminated(reason)
    }
}

fn close_reason(code: ws::CloseCode, description: &str) -> ws::CloseReason {
    let mut end = description.len().min(MAX_CLOSE_DESCRIPTION);
    while !description.is_char_boundary(end) {
        end -= 1;
    }
    ws::CloseReason {
        code,
        description: Some(description[..end].to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::gate::EngineGate;
    use crate::transcription::testing::{CallLog, EngineCall, ScriptedEngine};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn session(engine: ScriptedEngine) -> (ConnectionSession, UnboundedReceiver<Outbound>) {
        let state = AppState::new(AppConfig::default(), EngineGate::new(Box::new(engine)));
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionSession::new(Uuid::new_v4(), state, tx), rx)
    }

    #[tokio::test]
    async fn test_audio_opens_utterance_and_holds_gate() {
        let log = CallLog::default();
        let (mut session, _rx) = session(ScriptedEngine::new(log.clone()));

        session.handle(Frame::AudioChunk(vec![1, 2])).await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert!(session.state.gate.is_held());

        session.handle(Frame::AudioChunk(vec![3])).await.unwrap();
        assert_eq!(
            log.calls(),
            vec![
                EngineCall::Open(1),
                EngineCall::Feed(1, vec![1, 2]),
                EngineCall::Feed(1, vec![3]),
            ]
        );
    }

    #[tokio::test]
    async fn test_end_of_stream_replies_and_releases() {
        let (mut session, mut rx) = session(ScriptedEngine::new(CallLog::default()).with_transcript("hello"));

        session.handle(Frame::AudioChunk(vec![0; 160])).await.unwrap();
        session.handle(Frame::EndOfStream).await.unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.state.gate.is_held());
        assert_eq!(rx.recv().await, Some(Outbound::Transcript("hello".into())));
        assert_eq!(session.utterances_completed(), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_while_idle_is_policy_close() {
        let log = CallLog::default();
        let (mut session, mut rx) = session(ScriptedEngine::new(log.clone()));

        let err = session.handle(Frame::EndOfStream).await.unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(log.calls().is_empty());

        match rx.recv().await {
            Some(Outbound::Close(Some(reason))) => assert_eq!(reason.code, ws::CloseCode::Policy),
            other => panic!("expected policy close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_ignores_everything() {
        let log = CallLog::default();
        let (mut session, _rx) = session(ScriptedEngine::new(log.clone()));

        let _ = session
            .handle(Frame::ConnectionTerminated(Termination::StreamEnded))
            .await;
        assert_eq!(session.state(), SessionState::Closed);

        session.handle(Frame::AudioChunk(vec![1])).await.unwrap();
        session.handle(Frame::EndOfStream).await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_finish_failure_reports_and_returns_to_idle() {
        let log = CallLog::default();
        let engine = ScriptedEngine::new(log.clone())
            .failing_finish(EngineError::Utterance("no speech detected".into()));
        let (mut session, mut rx) = session(engine);

        session.handle(Frame::AudioChunk(vec![5])).await.unwrap();
        let err = session.handle(Frame::EndOfStream).await.unwrap_err();

        assert!(!err.is_terminal());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.state.gate.is_held());
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Failure("recognition failed: no speech detected".into()))
        );
        // finish consumed the handle, so nothing is left to abort
        assert_eq!(log.count(|call| matches!(call, EngineCall::Abort(_))), 0);
        assert_eq!(session.state.get_metrics_snapshot().utterances_failed, 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_closes_with_try_again() {
        let mut config = AppConfig::default();
        config.session.acquire_timeout_ms = Some(20);
        let log = CallLog::default();
        let gate = EngineGate::new(Box::new(ScriptedEngine::new(log.clone())));
        let state = AppState::new(config, gate.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConnectionSession::new(Uuid::new_v4(), state, tx);

        let holder = gate.acquire(Uuid::new_v4()).await.unwrap();
        let err = session.handle(Frame::AudioChunk(vec![1])).await.unwrap_err();
        drop(holder);

        assert!(matches!(err, SessionError::GateUnavailable(GateError::Timeout(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(log.calls().is_empty());
        assert!(matches!(rx.recv().await, Some(Outbound::Failure(_))));
        match rx.recv().await {
            Some(Outbound::Close(Some(reason))) => assert_eq!(reason.code, ws::CloseCode::Again),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_close_description_is_truncated_on_char_boundary() {
        let reason = close_reason(ws::CloseCode::Policy, &"é".repeat(100));
        let description = reason.description.unwrap();
        assert!(description.len() <= MAX_CLOSE_DESCRIPTION);
        assert!(description.chars().all(|c| c == 'é'));
    }
}
