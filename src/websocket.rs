//! # WebSocket Recognition Endpoint
//!
//! Clients connect to `/recognize`, stream raw audio, and get one transcript back
//! per utterance.
//!
//! ## WebSocket Protocol:
//! 1. **Audio**: Binary frames carrying 16-bit little-endian mono PCM at 16kHz
//! 2. **End of utterance**: A text frame containing exactly `EOS`
//! 3. **Transcript**: The server answers with one text frame holding the transcript
//! 4. **Failure**: A failed utterance is answered with `ERR: <message>` instead
//!
//! Any other text frame, or a binary frame with an odd number of bytes, closes the
//! connection with code 1008 (policy violation).
//!
//! ## Actor Layout:
//! `RecognizeSocket` only moves frames. Inbound reads go over a channel to the
//! session task (see [`run_session`]); the session's replies come back as an actor
//! stream of [`Outbound`] values. Pings and the heartbeat are handled here and never
//! reach the session.
//!
//! The inbound channel holds at most `session.max_queued_frames` reads. A client that
//! outruns a busy session (queued for the engine or mid-decode) is closed with 1013.

use crate::session::frame::RawRead;
use crate::session::{run_session, Outbound};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError, Sender};
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One websocket connection.
pub struct RecognizeSocket {
    session_id: Uuid,
    state: AppState,
    /// Reads waiting for the session task; dropped when the actor stops
    inbound: Option<Sender<RawRead>>,
    /// Last time the client showed any sign of life
    last_heartbeat: Instant,
    /// A close frame has been sent
    closed: bool,
}

impl RecognizeSocket {
    pub fn new(session_id: Uuid, state: AppState) -> Self {
        Self {
            session_id,
            state,
            inbound: None,
            last_heartbeat: Instant::now(),
            closed: false,
        }
    }

    fn close(&mut self, reason: Option<ws::CloseReason>, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.closed {
            self.closed = true;
            ctx.close(reason);
        }
        ctx.stop();
    }

    /// Hand a read to the session. Returns false if the session is too far behind.
    fn forward(&mut self, read: RawRead) -> bool {
        let Some(inbound) = &self.inbound else {
            return true;
        };
        match inbound.try_send(read) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    session_id = %self.session_id,
                    queued = inbound.max_capacity(),
                    "too many frames queued for a busy session"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "session already closed, dropping frame");
                true
            }
        }
    }

    /// Ping the client, or give up on it once it has been silent for too long.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = self.state.config.session.heartbeat_interval();
        let timeout = self.state.config.session.client_timeout();

        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(session_id = %act.session_id, "websocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }
}

impl Actor for RecognizeSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Spawn the session task and wire both directions of the connection to it.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "websocket connection started");

        let (inbound_tx, inbound_rx) = mpsc::channel(self.state.config.session.max_queued_frames);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.inbound = Some(inbound_tx);

        let session = run_session(
            self.session_id,
            ReceiverStream::new(inbound_rx),
            self.state.clone(),
            outbound_tx,
        );
        tokio::spawn(async move {
            let summary = session.await;
            info!(
                session_id = %summary.session_id,
                utterances = summary.utterances_completed,
                duration_ms = summary.duration.as_millis() as u64,
                ended_by = ?summary.ended_by,
                "session closed"
            );
        });
        ctx.add_stream(UnboundedReceiverStream::new(outbound_rx));

        self.start_heartbeat(ctx);
    }

    /// Dropping the sender is how the session learns the connection is gone.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.inbound = None;
        info!(session_id = %self.session_id, "websocket connection stopped");
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RecognizeSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, ?reason, "client closed websocket");
                // If the queue is full, stopping drops the sender, which the session sees too.
                self.forward(Ok(ws::Message::Close(reason.clone())));
                self.close(reason, ctx);
            }
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "websocket protocol error");
                self.forward(Err(err));
                ctx.stop();
            }
            Ok(message) => {
                if !self.forward(Ok(message)) {
                    let reason = ws::CloseReason {
                        code: ws::CloseCode::Again,
                        description: Some("too much audio queued".to_string()),
                    };
                    self.close(Some(reason), ctx);
                }
            }
        }
    }
}

/// Replies from the session task.
impl StreamHandler<Outbound> for RecognizeSocket {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Close(reason) => self.close(reason, ctx),
            reply => {
                if let Some(text) = reply.text() {
                    ctx.text(text);
                }
            }
        }
    }

    /// The session task has ended, so there is nothing left to serve.
    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "session ended, closing websocket");
        self.close(Some(ws::CloseCode::Normal.into()), ctx);
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the HTTP request; from then on the `RecognizeSocket` actor owns the connection.
pub async fn recognize(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = Uuid::new_v4();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "new websocket connection request"
    );

    let max_frame_bytes = app_state.get_config().session.max_frame_bytes;
    let socket = RecognizeSocket::new(session_id, app_state.get_ref().clone());

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}
