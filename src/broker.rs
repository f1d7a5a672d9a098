//! Broker adapter contract
//!
//! The ledger talks to the message broker only through these traits. A
//! consumer delivers [`BusEvent`]s to one handler at a time, a producer sends
//! them, and an admin handle provisions topics.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Unit exchanged with the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub key: String,
    pub value: Option<Value>,
}

impl BusEvent {
    pub fn new(key: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Record as it arrives from the broker, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub partition: u32,
    pub key: Option<String>,
    pub value: Option<Value>,
}

/// Callback attached to a consumer
pub type BusHandler = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, Result<(), AppError>> + Send + Sync>;

/// Wrap an async closure as a [`BusHandler`]
pub fn bus_handler<F, Fut>(f: F) -> BusHandler
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), AppError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Validate a delivered record and hand it to `handler`
///
/// A record without a key never reaches the handler.
pub async fn deliver(group: &str, record: BusRecord, handler: &BusHandler) -> Result<(), AppError> {
    let Some(key) = record.key else {
        return Err(AppError::MissingKey {
            group: group.to_string(),
            topic: record.topic,
            partition: record.partition,
        });
    };
    handler(BusEvent {
        key,
        value: record.value,
    })
    .await
}

/// Live broker consumer
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Start delivering events to `handler`, replacing any previous handler
    fn set_handler(&self, handler: BusHandler);

    async fn destroy(&self) -> Result<(), AppError>;
}

/// Live broker producer
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(&self, events: Vec<BusEvent>) -> Result<(), AppError>;

    async fn destroy(&self) -> Result<(), AppError>;
}

/// Topic provisioning handle
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn create_topic(&self, name: &str, partitions: u32) -> Result<(), AppError>;

    async fn destroy(&self) -> Result<(), AppError>;
}

/// Factory for broker handles
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn create_consumer(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerConsumer>, AppError>;

    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn BrokerProducer>, AppError>;

    async fn create_admin(&self) -> Result<Arc<dyn BrokerAdmin>, AppError>;
}
