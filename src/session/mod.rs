//! # Recognition Sessions
//!
//! Everything between a websocket frame arriving and the engine being driven.
//!
//! ## Components:
//! - **frame**: Classifies raw websocket reads into session events
//! - **gate**: FIFO exclusive-access scheduler owning the single engine instance
//! - **connection**: Per-connection state machine (Idle, Streaming, Finalizing, Closed)
//! - **supervisor**: Per-connection task that reads, classifies and dispatches
//!
//! The session layer never writes to the socket itself. Replies travel as
//! [`Outbound`] values over a channel to the transport actor.

pub mod frame;
pub mod gate;
pub mod connection;
pub mod supervisor;

use actix_web_actors::ws;

pub use gate::EngineGate;
pub use supervisor::run_session;

/// Prefix of the text frame reporting a failed utterance.
pub const FAILURE_PREFIX: &str = "ERR: ";

/// A reply the session wants delivered to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Best transcript of a finished utterance
    Transcript(String),
    /// Failed utterance, sent as `ERR: <message>`
    Failure(String),
    /// Close the connection, optionally with a code and description
    Close(Option<ws::CloseReason>),
}

impl Outbound {
    /// Text frame payload for transcript and failure replies.
    pub fn text(&self) -> Option<String> {
        match self {
            Outbound::Transcript(text) => Some(text.clone()),
            Outbound::Failure(message) => Some(format!("{}{}", FAILURE_PREFIX, message)),
            Outbound::Close(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_text() {
        assert_eq!(Outbound::Transcript("hello".into()).text().as_deref(), Some("hello"));
        assert_eq!(
            Outbound::Failure("recognition failed: no audio".into()).text().as_deref(),
            Some("ERR: recognition failed: no audio")
        );
        assert_eq!(Outbound::Close(None).text(), None);
    }
}
