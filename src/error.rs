//! # Error Handling
//!
//! Error types for every layer of the server, each with a hand-written `Display`
//! so log lines and client-facing `ERR:` frames read the same way.
//!
//! ## Error Layers:
//! - **AppError**: HTTP endpoints, converted into JSON responses
//! - **EngineError**: Raised by the recognition engine during an utterance
//! - **GateError**: Raised when the engine gate cannot be acquired
//! - **SessionError**: Everything that can end or fail an utterance on a connection
//!
//! ## Recovery Policy:
//! Only a recoverable `EngineError` leaves the connection open. Every other
//! `SessionError` closes it. A fatal `EngineError` additionally poisons the gate
//! and brings the process down.

use crate::session::frame::Termination;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Errors returned by the HTTP endpoints.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (serialization failures and the like)
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses with a consistent JSON body:
/// ```json
/// {
///   "error": {
///     "type": "internal_error",
///     "message": "...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg.clone()),
        };

        HttpResponse::InternalServerError().json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", err))
    }
}

/// Failure reported by a recognition engine.
///
/// ## Variants:
/// - **Utterance**: Only the current utterance is lost; the engine stays usable
/// - **Fatal**: Engine state can no longer be trusted; nothing may use it again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Utterance(String),
    Fatal(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            EngineError::Utterance(msg) | EngineError::Fatal(msg) => msg,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Utterance(msg) => write!(f, "recognition failed: {}", msg),
            EngineError::Fatal(msg) => write!(f, "recognition engine failed: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Reasons the engine gate refused to hand out a permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// A fatal engine failure poisoned the gate
    Poisoned(String),
    /// The configured acquisition deadline passed first
    Timeout(Duration),
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::Poisoned(reason) => write!(f, "recognition engine unavailable: {}", reason),
            GateError::Timeout(waited) => {
                write!(f, "recognition engine busy: no slot within {}ms", waited.as_millis())
            }
        }
    }
}

impl std::error::Error for GateError {}

/// Everything that can interrupt a connection session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A frame arrived in a state that forbids it
    ProtocolViolation(String),

    /// The connection ended (cleanly or not) before the session did
    Terminated(Termination),

    /// A reply could not be delivered to the client
    TransportFailure,

    /// The engine failed while processing an utterance
    Engine(EngineError),

    /// The engine gate could not be acquired
    GateUnavailable(GateError),
}

impl SessionError {
    /// Whether this error ends the connection.
    pub fn is_terminal(&self) -> bool {
        match self {
            SessionError::Engine(err) => err.is_fatal(),
            _ => true,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            SessionError::Terminated(reason) => write!(f, "connection terminated: {}", reason),
            SessionError::TransportFailure => write!(f, "failed to deliver reply to client"),
            SessionError::Engine(err) => write!(f, "{}", err),
            SessionError::GateUnavailable(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        SessionError::Engine(err)
    }
}

impl From<GateError> for SessionError {
    fn from(err: GateError) -> Self {
        SessionError::GateUnavailable(err)
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
