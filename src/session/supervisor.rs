//! Per-connection task: read, classify, transition, until the session closes.

use super::connection::{ConnectionSession, SessionState};
use super::frame::{classify, RawRead, Termination};
use super::Outbound;
use crate::error::SessionError;
use crate::state::AppState;
use futures_util::{Stream, StreamExt};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// How a session went, returned when its task ends.
#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub utterances_completed: u32,
    pub duration: Duration,
    /// The error that closed the session
    pub ended_by: Option<SessionError>,
}

/// Keeps the active-session gauge right even if the task is cancelled.
struct ActiveSession(AppState);

impl ActiveSession {
    fn enter(state: &AppState) -> Self {
        state.session_opened();
        Self(state.clone())
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.session_closed();
    }
}

/// Drive one connection's session to completion.
///
/// `reads` yields raw transport reads; its end counts as the connection going away.
/// Replies go to `outbound`. Returns once the session is `Closed`.
pub async fn run_session<S>(
    session_id: Uuid,
    mut reads: S,
    state: AppState,
    outbound: UnboundedSender<Outbound>,
) -> SessionSummary
where
    S: Stream<Item = RawRead> + Unpin,
{
    let _active = ActiveSession::enter(&state);
    let started = Instant::now();
    let mut session = ConnectionSession::new(session_id, state, outbound);
    let mut ended_by = None;

    debug!(session_id = %session_id, "session started");

    while session.state() != SessionState::Closed {
        let raw = reads.next().await;
        let frame = classify(raw.as_ref());

        if let Err(err) = session.handle(frame).await {
            log_session_error(session_id, &err);
            ended_by = Some(err);
        }
    }

    SessionSummary {
        session_id,
        utterances_completed: session.utterances_completed(),
        duration: started.elapsed(),
        ended_by,
    }
}

fn log_session_error(session_id: Uuid, err: &SessionError) {
    match err {
        SessionError::Terminated(Termination::ClientClosed(_) | Termination::StreamEnded) => {
            debug!(session_id = %session_id, "{}", err)
        }
        SessionError::Engine(engine_err) if engine_err.is_fatal() => {
            error!(session_id = %session_id, error = %err, "engine failure")
        }
        SessionError::Engine(_) => warn!(session_id = %session_id, error = %err, "utterance failed"),
        _ => warn!(session_id = %session_id, error = %err, "session ended"),
    }
}
