//! # Frame Classification
//!
//! Turns each websocket read into one of the three events the session state
//! machine understands. Classification is a pure function of the read.
//!
//! ## Classes:
//! - **AudioChunk**: binary payload, decoded as s16le PCM
//! - **EndOfStream**: text payload exactly equal to [`END_OF_STREAM`]
//! - **ConnectionTerminated**: everything else, with the reason attached
//!
//! Ping, pong and no-op frames are answered by the transport adapter and never
//! reach the classifier; should one arrive here it counts as an anomalous read.

use crate::audio::decode_pcm16le;
use actix_web_actors::ws;
use std::fmt;

/// Control value marking the end of an utterance.
pub const END_OF_STREAM: &str = "EOS";

/// Longest slice of an unexpected text frame kept for diagnostics.
const TEXT_EXCERPT_CHARS: usize = 32;

/// One read from the transport: a message, a protocol error, or (as `None`) end of stream.
pub type RawRead = Result<ws::Message, ws::ProtocolError>;

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    AudioChunk(Vec<i16>),
    EndOfStream,
    ConnectionTerminated(Termination),
}

/// Why a connection counts as terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Client sent a close frame, with its close code if any
    ClientClosed(Option<u16>),
    /// Transport stream ended without a close frame
    StreamEnded,
    /// Websocket protocol error while reading
    TransportError(String),
    /// Text frame other than the end-of-stream sentinel
    UnexpectedText(String),
    /// Binary frame that is not a whole number of samples
    MalformedAudio(String),
    /// Frame type the protocol never uses
    UnsupportedFrame(&'static str),
}

impl Termination {
    /// Whether the client broke the protocol, as opposed to simply going away.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Termination::UnexpectedText(_)
                | Termination::MalformedAudio(_)
                | Termination::UnsupportedFrame(_)
        )
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::ClientClosed(Some(code)) => write!(f, "client closed the connection ({})", code),
            Termination::ClientClosed(None) => write!(f, "client closed the connection"),
            Termination::StreamEnded => write!(f, "connection dropped"),
            Termination::TransportError(err) => write!(f, "transport error: {}", err),
            Termination::UnexpectedText(text) => write!(f, "unexpected text frame {:?}", text),
            Termination::MalformedAudio(err) => write!(f, "malformed audio frame: {}", err),
            Termination::UnsupportedFrame(kind) => write!(f, "unsupported {} frame", kind),
        }
    }
}

/// Classify one transport read. `None` means the read side has ended.
pub fn classify(raw: Option<&RawRead>) -> Frame {
    let message = match raw {
        None => return Frame::ConnectionTerminated(Termination::StreamEnded),
        Some(Err(err)) => {
            return Frame::ConnectionTerminated(Termination::TransportError(err.to_string()))
        }
        Some(Ok(message)) => message,
    };

    let termination = match message {
        ws::Message::Binary(bytes) => {
            return match decode_pcm16le(bytes) {
                Ok(samples) => Frame::AudioChunk(samples),
                Err(err) => Frame::ConnectionTerminated(Termination::MalformedAudio(err.to_string())),
            };
        }
        ws::Message::Text(text) if &**text == END_OF_STREAM => return Frame::EndOfStream,
        ws::Message::Text(text) => {
            Termination::UnexpectedText(text.chars().take(TEXT_EXCERPT_CHARS).collect())
        }
        ws::Message::Close(reason) => {
            Termination::ClientClosed(reason.as_ref().map(|reason| u16::from(reason.code)))
        }
        ws::Message::Continuation(_) => Termination::UnsupportedFrame("continuation"),
        ws::Message::Ping(_) => Termination::UnsupportedFrame("ping"),
        ws::Message::Pong(_) => Termination::UnsupportedFrame("pong"),
        ws::Message::Nop => Termination::UnsupportedFrame("no-op"),
    };

    Frame::ConnectionTerminated(termination)
}
