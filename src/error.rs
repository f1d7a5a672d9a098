//! Error types for the relay
//!
//! Defines application-level errors, their classification, and
//! outbound channel send errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Every variant belongs to exactly one [`ErrorKind`]. Only `Fatal` kinds
/// escape a middleware chain; everything else is handed to the error sink.
#[derive(Debug, Error)]
pub enum AppError {
    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload parsed but failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Non-text frame received where JSON text was expected
    #[error("Unsupported frame: only JSON text frames are accepted")]
    UnsupportedFrame,

    /// No consumer registered under the group id
    #[error("Consumer for group {0} not found")]
    ConsumerNotFound(String),

    /// No producer registered for the topic
    #[error("Producer for topic {0} not found")]
    ProducerNotFound(String),

    /// Mounted route table has no root
    #[error("Cannot mount an empty route table at {0}")]
    InvalidMount(String),

    /// A handler advanced the same chain step twice
    #[error("Middleware at index {index} advanced more than once")]
    DoubleAdvance { index: usize },

    /// Broker delivered a record without a key
    #[error("Missing key on record from group {group}, topic {topic}, partition {partition}")]
    MissingKey {
        group: String,
        topic: String,
        partition: u32,
    },

    /// Broker operation failed
    #[error("Broker error: {0}")]
    Broker(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (connection writer gone)
    #[error("Channel send error")]
    ChannelSend,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected defect that must not be absorbed by the error sink
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad payload or failed validation
    ClientInput,
    /// Named resource missing from the ledger or route table
    NotFound,
    /// Handler or broker misuse
    ProtocolDefect,
    /// Broker or socket failure
    Transport,
    /// Not recoverable
    Fatal,
}

impl AppError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Json(_) | AppError::Validation(_) | AppError::UnsupportedFrame => {
                ErrorKind::ClientInput
            }
            AppError::ConsumerNotFound(_)
            | AppError::ProducerNotFound(_)
            | AppError::InvalidMount(_) => ErrorKind::NotFound,
            AppError::DoubleAdvance { .. } | AppError::MissingKey { .. } => {
                ErrorKind::ProtocolDefect
            }
            AppError::Broker(_) | AppError::WebSocket(_) | AppError::Io(_) | AppError::ChannelSend => {
                ErrorKind::Transport
            }
            AppError::Config(_) | AppError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a middleware chain routes this error to the sink
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Fatal
    }
}

impl From<SendError> for AppError {
    fn from(_: SendError) -> Self {
        AppError::ChannelSend
    }
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
