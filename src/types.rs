//! Basic type definitions for the relay
//!
//! Provides:
//! - `ConnectionId`: UUID-based unique connection identifier
//! - `Event`: the event name that terminates a route registration

use std::fmt;

use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4 for type-safe connection identification.
/// Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection event name
///
/// The four built-in events are raised by the dispatcher. `Custom` lets the
/// route table hold handlers for any other event string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    /// Connection accepted
    Connection,
    /// Inbound JSON message
    Message,
    /// Connection closed
    Close,
    /// Transport error on the connection
    Error,
    /// Any other event name
    Custom(String),
}

impl Event {
    /// Get the event name as used for trie lookups
    pub fn as_str(&self) -> &str {
        match self {
            Event::Connection => "connection",
            Event::Message => "message",
            Event::Close => "close",
            Event::Error => "error",
            Event::Custom(name) => name,
        }
    }
}

impl AsRef<str> for Event {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        match name {
            "connection" => Event::Connection,
            "message" => Event::Message,
            "close" => Event::Close,
            "error" => Event::Error,
            other => Event::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Event::Connection.as_str(), "connection");
        assert_eq!(Event::from("close"), Event::Close);
        assert_eq!(Event::from("typing"), Event::Custom("typing".to_string()));
        assert_eq!(Event::Custom("typing".to_string()).to_string(), "typing");
    }
}
