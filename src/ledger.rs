//! Broker resource ledger
//!
//! Owns every consumer and producer handle the relay holds on the broker.
//! Consumers are keyed by group id, one per group. Producers are pooled per
//! topic and reference counted: the broker-level producer is created by the
//! first `add_producer` for a topic and destroyed by the matching last
//! `remove_producer`.
//!
//! The maps sit behind one async mutex that is only held for bookkeeping,
//! never across a broker call. Producer creation goes through a per-topic
//! `OnceCell`, so concurrent `add_producer` calls for one topic share a single
//! creation while other topics proceed. Destroy calls run after the entry has
//! left the map.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::broker::{BrokerAdapter, BrokerConsumer, BrokerProducer, BusEvent, BusHandler};
use crate::config::RetryPolicy;
use crate::error::{AppError, ErrorKind};

type ProducerCell = Arc<OnceCell<Arc<dyn BrokerProducer>>>;

struct PooledProducer {
    cell: ProducerCell,
    refs: usize,
}

impl PooledProducer {
    fn pending() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            refs: 0,
        }
    }

    /// Handle of a producer somebody holds a reference on
    fn live(&self) -> Option<&Arc<dyn BrokerProducer>> {
        if self.refs == 0 {
            return None;
        }
        self.cell.get()
    }
}

#[derive(Default)]
struct LedgerState {
    consumers: HashMap<String, Arc<dyn BrokerConsumer>>,
    producers: HashMap<String, PooledProducer>,
}

/// Shared registry of broker consumers and producers
pub struct BrokerLedger {
    adapter: Arc<dyn BrokerAdapter>,
    retry: RetryPolicy,
    state: Mutex<LedgerState>,
}

impl BrokerLedger {
    /// Create a ledger that never retries handle creation
    pub fn new(adapter: Arc<dyn BrokerAdapter>) -> Self {
        Self::with_retry(adapter, RetryPolicy::default())
    }

    pub fn with_retry(adapter: Arc<dyn BrokerAdapter>, retry: RetryPolicy) -> Self {
        Self {
            adapter,
            retry,
            state: Mutex::new(LedgerState::default()),
        }
    }

    async fn create_with_retry<T, F, Fut>(&self, what: &str, create: F) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 1;
        loop {
            match create().await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.kind() == ErrorKind::Transport && attempt < self.retry.attempts => {
                    warn!(
                        "Creating {} failed (attempt {}/{}): {}",
                        what, attempt, self.retry.attempts, e
                    );
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create a consumer for `group_id` subscribed to `topics`
    ///
    /// A second call for the same group replaces the stored handle without
    /// destroying the previous one; call `remove_consumer` first to release it.
    pub async fn add_consumer(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerConsumer>, AppError> {
        let consumer = self
            .create_with_retry("consumer", || self.adapter.create_consumer(group_id, topics))
            .await?;

        let previous = self
            .state
            .lock()
            .await
            .consumers
            .insert(group_id.to_string(), consumer.clone());
        if previous.is_some() {
            warn!(
                "Consumer for group {} replaced; previous handle was not destroyed",
                group_id
            );
        }
        info!("Consumer for group {} subscribed to {:?}", group_id, topics);
        Ok(consumer)
    }

    /// Attach the message callback of the consumer at `group_id`
    pub async fn register_consumer_handler(
        &self,
        group_id: &str,
        handler: BusHandler,
    ) -> Result<(), AppError> {
        let consumer = self
            .state
            .lock()
            .await
            .consumers
            .get(group_id)
            .cloned()
            .ok_or_else(|| AppError::ConsumerNotFound(group_id.to_string()))?;
        consumer.set_handler(handler);
        Ok(())
    }

    /// Take a reference on the producer for `topic`, creating it on first use
    pub async fn add_producer(&self, topic: &str) -> Result<Arc<dyn BrokerProducer>, AppError> {
        loop {
            let cell = {
                let mut state = self.state.lock().await;
                state
                    .producers
                    .entry(topic.to_string())
                    .or_insert_with(PooledProducer::pending)
                    .cell
                    .clone()
            };

            let handle = cell
                .get_or_try_init(|| {
                    self.create_with_retry("producer", || self.adapter.create_producer(topic))
                })
                .await?
                .clone();

            let mut state = self.state.lock().await;
            match state.producers.get_mut(topic) {
                Some(pooled) if Arc::ptr_eq(&pooled.cell, &cell) => {
                    pooled.refs += 1;
                    if pooled.refs == 1 {
                        info!("Producer for topic {} created", topic);
                    } else {
                        debug!("Producer for topic {} now has {} references", topic, pooled.refs);
                    }
                    return Ok(handle);
                }
                // Released by its last holder while we waited; that handle is gone
                _ => debug!("Producer for topic {} released during acquire, retrying", topic),
            }
        }
    }

    /// Send `event` through the pooled producer for `topic`
    pub async fn submit_event(&self, topic: &str, event: BusEvent) -> Result<(), AppError> {
        let producer = self
            .state
            .lock()
            .await
            .producers
            .get(topic)
            .and_then(PooledProducer::live)
            .cloned()
            .ok_or_else(|| AppError::ProducerNotFound(topic.to_string()))?;
        producer.send(vec![event]).await
    }

    /// Destroy and forget the consumer at `group_id`
    pub async fn remove_consumer(&self, group_id: &str) -> Result<(), AppError> {
        let removed = self.state.lock().await.consumers.remove(group_id);
        let Some(consumer) = removed else {
            return Ok(());
        };
        consumer.destroy().await?;
        info!("Consumer for group {} removed", group_id);
        Ok(())
    }

    /// Drop one reference on the producer for `topic`
    ///
    /// The broker-level producer is destroyed when the last reference goes.
    pub async fn remove_producer(&self, topic: &str) -> Result<(), AppError> {
        let released = {
            let mut state = self.state.lock().await;
            let Some(pooled) = state.producers.get_mut(topic) else {
                return Ok(());
            };
            if pooled.refs == 0 {
                return Ok(());
            }

            pooled.refs -= 1;
            if pooled.refs > 0 {
                debug!("Producer for topic {} now has {} references", topic, pooled.refs);
                return Ok(());
            }
            state
                .producers
                .remove(topic)
                .and_then(|pooled| pooled.cell.get().cloned())
        };

        if let Some(handle) = released {
            handle.destroy().await?;
        }
        info!("Producer for topic {} destroyed", topic);
        Ok(())
    }

    /// Whether a consumer is registered for `group_id`
    pub async fn has_consumer(&self, group_id: &str) -> bool {
        self.state.lock().await.consumers.contains_key(group_id)
    }

    /// Current reference count of the producer for `topic`
    pub async fn producer_refs(&self, topic: &str) -> Option<usize> {
        self.state
            .lock()
            .await
            .producers
            .get(topic)
            .filter(|pooled| pooled.live().is_some())
            .map(|pooled| pooled.refs)
    }

    /// Destroy every owned handle
    pub async fn shutdown(&self) {
        let (consumers, producers) = {
            let mut state = self.state.lock().await;
            (
                std::mem::take(&mut state.consumers),
                std::mem::take(&mut state.producers),
            )
        };

        for (group_id, consumer) in consumers {
            if let Err(e) = consumer.destroy().await {
                warn!("Failed to destroy consumer for group {}: {}", group_id, e);
            }
        }
        for (topic, pooled) in producers {
            let Some(handle) = pooled.cell.get() else {
                continue;
            };
            if let Err(e) = handle.destroy().await {
                warn!("Failed to destroy producer for topic {}: {}", topic, e);
            }
        }
        info!("Broker ledger shut down");
    }
}
