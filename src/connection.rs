//! Connection handle
//!
//! The value every handler receives for the connection an event belongs to.
//! Cloning is cheap; all clones feed the same outbound channel.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SendError;
use crate::message::{Outbound, ServerMessage};
use crate::types::ConnectionId;

/// WebSocket close code for a normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code for policy violations
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Longest close reason a WebSocket close frame can carry, in bytes
pub const MAX_CLOSE_REASON: usize = 123;

/// Handle to one open connection
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Request path the connection was opened on
    pub path: String,
    /// Server → Client frame channel
    sender: mpsc::Sender<Outbound>,
}

impl Connection {
    /// Create a connection handle over an outbound channel
    pub fn new(id: ConnectionId, path: impl Into<String>, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            path: path.into(),
            sender,
        }
    }

    /// Queue a raw JSON frame
    ///
    /// Returns an error if the channel is closed (client disconnected).
    pub async fn send_json(&self, frame: Value) -> Result<(), SendError> {
        self.sender
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Queue a server message
    pub async fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        // ServerMessage contains only strings and JSON values
        let frame = serde_json::to_value(&msg).unwrap_or(Value::Null);
        self.send_json(frame).await
    }

    /// Ask the writer to close the connection
    ///
    /// Reasons longer than [`MAX_CLOSE_REASON`] are cut at a char boundary.
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), SendError> {
        self.sender
            .send(Outbound::Close {
                code,
                reason: truncate_reason(reason.into()),
            })
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Check whether the writer side is gone
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Wait until the writer side is gone
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_queues_frame() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::new(), "/chat", tx);

        conn.send(ServerMessage::Connected {
            client_id: conn.id.to_string(),
        })
        .await
        .unwrap();

        match rx.recv().await {
            Some(Outbound::Frame(frame)) => assert_eq!(frame["type"], "connected"),
            other => panic!("unexpected outbound item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_after_disconnect() {
        let (tx, rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::new(), "/chat", tx);
        drop(rx);

        assert!(conn.is_closed());
        assert!(conn.send_json(Value::Null).await.is_err());
        assert!(conn.close(CLOSE_POLICY_VIOLATION, "bye").await.is_err());
    }

    #[tokio::test]
    async fn test_close_reason_fits_close_frame() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(ConnectionId::new(), "/chat", tx);

        conn.close(CLOSE_POLICY_VIOLATION, "é".repeat(100)).await.unwrap();

        match rx.recv().await {
            Some(Outbound::Close { code, reason }) => {
                assert_eq!(code, CLOSE_POLICY_VIOLATION);
                assert_eq!(reason.len(), 122);
                assert!(reason.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected outbound item: {:?}", other),
        }
    }

    #[test]
    fn test_short_close_reason_untouched() {
        assert_eq!(truncate_reason("bye".to_string()), "bye");
    }
}
