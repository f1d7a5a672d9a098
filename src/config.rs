//! Runtime configuration
//!
//! Defaults, JSON documents, and `CHAT_RELAY_*` environment overrides.

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Default per-connection outbound queue size
pub const DEFAULT_OUTBOUND_BUFFER: usize = 32;

/// Retry policy for creating broker handles
///
/// Applies to consumer and producer creation only. `attempts` counts the
/// first try, so the default of 1 never retries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling each time
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listener address
    pub bind_addr: String,
    /// Per-connection outbound queue size
    pub outbound_buffer: usize,
    /// Close connections with 1008 after a client input error
    pub close_on_client_error: bool,
    /// Topic the demo relay publishes room events on
    pub room_topic: String,
    /// Partitions provisioned for `room_topic`
    pub room_partitions: u32,
    /// Broker handle creation retries
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            close_on_client_error: false,
            room_topic: "rooms".to_string(),
            room_partitions: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Load from a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AppError::Config(format!("invalid config document: {}", e)))?;
        config.validate()
    }

    /// Defaults overridden by `CHAT_RELAY_*` environment variables
    pub fn from_env() -> Result<Self, AppError> {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("CHAT_RELAY_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(value) = lookup("CHAT_RELAY_OUTBOUND_BUFFER") {
            self.outbound_buffer = parse("CHAT_RELAY_OUTBOUND_BUFFER", &value)?;
        }
        if let Some(value) = lookup("CHAT_RELAY_CLOSE_ON_CLIENT_ERROR") {
            self.close_on_client_error = parse("CHAT_RELAY_CLOSE_ON_CLIENT_ERROR", &value)?;
        }
        if let Some(topic) = lookup("CHAT_RELAY_ROOM_TOPIC") {
            self.room_topic = topic;
        }
        if let Some(value) = lookup("CHAT_RELAY_ROOM_PARTITIONS") {
            self.room_partitions = parse("CHAT_RELAY_ROOM_PARTITIONS", &value)?;
        }
        if let Some(value) = lookup("CHAT_RELAY_RETRY_ATTEMPTS") {
            self.retry.attempts = parse("CHAT_RELAY_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("CHAT_RELAY_RETRY_BACKOFF_MS") {
            self.retry.backoff_ms = parse("CHAT_RELAY_RETRY_BACKOFF_MS", &value)?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, AppError> {
        if self.outbound_buffer == 0 {
            return Err(AppError::Config("outbound_buffer must be positive".to_string()));
        }
        if self.room_topic.is_empty() {
            return Err(AppError::Config("room_topic must not be empty".to_string()));
        }
        if self.room_partitions == 0 {
            return Err(AppError::Config("room_partitions must be positive".to_string()));
        }
        if self.retry.attempts == 0 {
            return Err(AppError::Config("retry.attempts must be at least 1".to_string()));
        }
        Ok(self)
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{} has invalid value '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, DEFAULT_ADDR);
        assert_eq!(config.retry.attempts, 1);
        assert!(!config.close_on_client_error);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            RelayConfig::from_json_str(r#"{"room_topic": "lobby", "retry": {"attempts": 3}}"#)
                .unwrap();
        assert_eq!(config.room_topic, "lobby");
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.backoff_ms, 0);
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(RelayConfig::from_json_str("not json").is_err());
        assert!(RelayConfig::from_json_str(r#"{"room_partitions": 0}"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHAT_RELAY_ADDR", "0.0.0.0:9000"),
            ("CHAT_RELAY_CLOSE_ON_CLIENT_ERROR", "true"),
            ("CHAT_RELAY_RETRY_ATTEMPTS", "4"),
        ]
        .into_iter()
        .collect();

        let config = RelayConfig::default()
            .with_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert!(config.close_on_client_error);
        assert_eq!(config.retry.attempts, 4);
    }

    #[test]
    fn test_env_override_parse_error() {
        let err = RelayConfig::default()
            .with_overrides(|name| (name == "CHAT_RELAY_OUTBOUND_BUFFER").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 4,
            backoff_ms: 10,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
    }
}
