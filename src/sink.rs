//! Error sink
//!
//! The single place a failed chain's error goes. Chains never write to the
//! connection themselves; the sink decides whether to reply, close, or both.

use async_trait::async_trait;
use tracing::{error, warn};

use crate::connection::{Connection, CLOSE_POLICY_VIOLATION};
use crate::error::{AppError, ErrorKind};
use crate::message::ServerMessage;

/// Receiver of chain errors
#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// Handle an error raised while processing an event on `conn`
    async fn report(&self, conn: &Connection, error: AppError);
}

/// Default sink: log, reply with an error frame, optionally close
#[derive(Debug, Clone, Default)]
pub struct ReplyErrorSink {
    /// Close the connection (1008) after a client input error
    pub close_on_client_error: bool,
}

impl ReplyErrorSink {
    pub fn new(close_on_client_error: bool) -> Self {
        Self {
            close_on_client_error,
        }
    }
}

#[async_trait]
impl ErrorSink for ReplyErrorSink {
    async fn report(&self, conn: &Connection, err: AppError) {
        let kind = err.kind();
        match kind {
            ErrorKind::ProtocolDefect | ErrorKind::Fatal => {
                error!("Connection {} on {}: {}", conn.id, conn.path, err);
            }
            _ => {
                warn!("Connection {} on {}: {}", conn.id, conn.path, err);
            }
        }

        if conn.send(ServerMessage::from(&err)).await.is_err() {
            return;
        }

        if kind == ErrorKind::ClientInput && self.close_on_client_error {
            let _ = conn.close(CLOSE_POLICY_VIOLATION, err.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Outbound;
    use crate::types::ConnectionId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_reply_sink_sends_error_frame() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::new(), "/chat", tx);

        ReplyErrorSink::new(false)
            .report(&conn, AppError::Validation("content required".into()))
            .await;

        match rx.recv().await {
            Some(Outbound::Frame(frame)) => {
                assert_eq!(frame["type"], "error");
                assert_eq!(frame["code"], "invalid_message");
            }
            other => panic!("unexpected outbound item: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reply_sink_closes_on_client_error() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::new(), "/chat", tx);

        ReplyErrorSink::new(true)
            .report(&conn, AppError::UnsupportedFrame)
            .await;

        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));
        match rx.recv().await {
            Some(Outbound::Close { code, .. }) => assert_eq!(code, CLOSE_POLICY_VIOLATION),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_sink_keeps_connection_on_defect() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::new(), "/chat", tx);

        ReplyErrorSink::new(true)
            .report(&conn, AppError::DoubleAdvance { index: 1 })
            .await;

        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));
        assert!(rx.try_recv().is_err());
    }
}
