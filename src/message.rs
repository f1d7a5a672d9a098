//! Message protocol definitions
//!
//! JSON text frames in both directions. Inbound frames are parsed into a
//! `serde_json::Value` before any handler sees them; outbound frames are
//! queued as [`Outbound`] items for the connection's writer task.

use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, ErrorKind};

/// Server → Client message
///
/// Frames produced by the relay itself. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted, client ID issued
    Connected { client_id: String },
    /// Event relayed from the broker
    Event { key: String, value: Option<Value> },
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format or failed validation
    InvalidMessage,
    /// Requested broker resource does not exist
    NotFound,
    /// Server-side handler misbehaved
    ProtocolError,
    /// Broker or transport unavailable
    Unavailable,
    /// Anything else
    InternalError,
}

/// Convert AppError to ServerMessage for client notification
impl From<&AppError> for ServerMessage {
    fn from(err: &AppError) -> Self {
        let (code, message) = match err.kind() {
            ErrorKind::ClientInput => (ErrorCode::InvalidMessage, err.to_string()),
            ErrorKind::NotFound => (ErrorCode::NotFound, err.to_string()),
            // Internal details of defects stay in the server log
            ErrorKind::ProtocolDefect => {
                (ErrorCode::ProtocolError, "Internal protocol error".to_string())
            }
            ErrorKind::Transport => (ErrorCode::Unavailable, "Service unavailable".to_string()),
            ErrorKind::Fatal => (ErrorCode::InternalError, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}

impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        ServerMessage::from(&err)
    }
}

/// Item queued for a connection's writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON text frame
    Frame(Value),
    /// Close frame, after which the writer stops
    Close { code: u16, reason: String },
}

/// Parse an inbound text frame
///
/// Anything that is not valid JSON is rejected as a client input error.
pub fn parse_frame(text: &str) -> Result<Value, AppError> {
    Ok(serde_json::from_str(text)?)
}
