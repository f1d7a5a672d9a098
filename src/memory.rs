//! In-process broker
//!
//! Implements the broker adapter contract over `tokio::sync::broadcast`
//! channels, one per topic. Every consumer subscribed to a topic sees every
//! record published to it; partitions are assigned from a hash of the key
//! and only travel as metadata.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{
    deliver, BrokerAdapter, BrokerAdmin, BrokerConsumer, BrokerProducer, BusEvent, BusHandler,
    BusRecord,
};
use crate::error::AppError;

/// Default per-topic buffer
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

struct Topic {
    partitions: u32,
    sender: broadcast::Sender<BusRecord>,
}

struct BrokerState {
    topics: Mutex<HashMap<String, Topic>>,
    capacity: usize,
    failing_connects: AtomicUsize,
}

/// Broker living inside the process
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a broker whose topics buffer up to `capacity` records
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                failing_connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `count` handle creations fail as if the broker were unreachable
    pub fn fail_next_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    fn connect(&self) -> Result<(), AppError> {
        let failing = self.state.failing_connects.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |left| left.checked_sub(1),
        );
        match failing {
            Ok(_) => Err(AppError::Broker("broker unreachable".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Topic>> {
        self.state
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of partitions of `name`, if the topic exists
    pub fn partitions(&self, name: &str) -> Option<u32> {
        self.topics().get(name).map(|topic| topic.partitions)
    }

    fn subscribe(&self, name: &str) -> broadcast::Receiver<BusRecord> {
        let capacity = self.state.capacity;
        self.topics()
            .entry(name.to_string())
            .or_insert_with(|| Topic {
                partitions: 1,
                sender: broadcast::channel(capacity).0,
            })
            .sender
            .subscribe()
    }

    /// Publish a record exactly as given, without validation
    ///
    /// Returns how many consumers received it.
    pub fn publish_raw(&self, record: BusRecord) -> usize {
        let capacity = self.state.capacity;
        let mut topics = self.topics();
        let topic = topics.entry(record.topic.clone()).or_insert_with(|| Topic {
            partitions: 1,
            sender: broadcast::channel(capacity).0,
        });
        match topic.sender.send(record) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(record)) => {
                debug!("No consumers on topic {}, record dropped", record.topic);
                0
            }
        }
    }

    fn publish(&self, topic: &str, event: BusEvent) -> usize {
        let partitions = self.partitions(topic).unwrap_or(1);
        let record = BusRecord {
            topic: topic.to_string(),
            partition: partition_for(&event.key, partitions),
            key: Some(event.key),
            value: event.value,
        };
        self.publish_raw(record)
    }
}

/// Pick a partition from the record key
fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

type HandlerSlot = Arc<RwLock<Option<BusHandler>>>;

/// Consumer over one or more topics
pub struct MemoryConsumer {
    group_id: String,
    handler: HandlerSlot,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl MemoryConsumer {
    fn start(broker: &MemoryBroker, group_id: &str, topics: &[String]) -> Self {
        let handler: HandlerSlot = Arc::new(RwLock::new(None));
        let tasks = topics
            .iter()
            .map(|topic| {
                let receiver = broker.subscribe(topic);
                tokio::spawn(delivery_loop(
                    group_id.to_string(),
                    topic.clone(),
                    receiver,
                    handler.clone(),
                ))
            })
            .collect();

        Self {
            group_id: group_id.to_string(),
            handler,
            tasks: Mutex::new(tasks),
            destroyed: AtomicBool::new(false),
        }
    }
}

async fn delivery_loop(
    group_id: String,
    topic: String,
    mut receiver: broadcast::Receiver<BusRecord>,
    handler: HandlerSlot,
) {
    loop {
        match receiver.recv().await {
            Ok(record) => {
                let current = handler
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                let Some(current) = current else {
                    debug!("Group {} has no handler, record on {} dropped", group_id, topic);
                    continue;
                };
                if let Err(e) = deliver(&group_id, record, &current).await {
                    error!("Delivery to group {} failed: {}", group_id, e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Group {} lagged on {}, {} records skipped", group_id, topic, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Delivery loop for group {} on {} ended", group_id, topic);
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    fn set_handler(&self, handler: BusHandler) {
        *self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    async fn destroy(&self) -> Result<(), AppError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
        debug!("Consumer for group {} destroyed", self.group_id);
        Ok(())
    }
}

/// Producer bound to one topic
pub struct MemoryProducer {
    broker: MemoryBroker,
    topic: String,
    destroyed: AtomicBool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, events: Vec<BusEvent>) -> Result<(), AppError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(AppError::Broker(format!(
                "producer for topic {} is destroyed",
                self.topic
            )));
        }
        for event in events {
            self.broker.publish(&self.topic, event);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), AppError> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Producer for topic {} destroyed", self.topic);
        }
        Ok(())
    }
}

/// Topic provisioning
pub struct MemoryAdmin {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerAdmin for MemoryAdmin {
    async fn create_topic(&self, name: &str, partitions: u32) -> Result<(), AppError> {
        if partitions == 0 {
            return Err(AppError::Broker(format!(
                "topic {} needs at least one partition",
                name
            )));
        }
        let capacity = self.broker.state.capacity;
        let mut topics = self.broker.topics();
        let topic = topics.entry(name.to_string()).or_insert_with(|| Topic {
            partitions,
            sender: broadcast::channel(capacity).0,
        });
        topic.partitions = partitions;
        info!("Topic {} ready with {} partitions", name, partitions);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
impl BrokerAdapter for MemoryBroker {
    async fn create_consumer(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerConsumer>, AppError> {
        self.connect()?;
        Ok(Arc::new(MemoryConsumer::start(self, group_id, topics)))
    }

    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn BrokerProducer>, AppError> {
        self.connect()?;
        Ok(Arc::new(MemoryProducer {
            broker: self.clone(),
            topic: topic.to_string(),
            destroyed: AtomicBool::new(false),
        }))
    }

    async fn create_admin(&self) -> Result<Arc<dyn BrokerAdmin>, AppError> {
        self.connect()?;
        Ok(Arc::new(MemoryAdmin {
            broker: self.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::bus_handler;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn forwarding() -> (BusHandler, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = bus_handler(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_produce_and_consume() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .create_consumer("g1", &["rooms".to_string()])
            .await
            .unwrap();
        let (handler, mut rx) = forwarding();
        consumer.set_handler(handler);

        let producer = broker.create_producer("rooms").await.unwrap();
        producer
            .send(vec![BusEvent::new("alice", Some(json!({"content": "hi"})))])
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.key, "alice");
        assert_eq!(event.value, Some(json!({"content": "hi"})));
    }

    #[tokio::test]
    async fn test_last_handler_wins() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .create_consumer("g1", &["rooms".to_string()])
            .await
            .unwrap();
        let (first, mut first_rx) = forwarding();
        let (second, mut second_rx) = forwarding();
        consumer.set_handler(first);
        consumer.set_handler(second);

        broker.publish("rooms", BusEvent::new("k", None));

        let event = timeout(Duration::from_secs(1), second_rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.key, "k");
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_key_never_reaches_handler() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .create_consumer("g1", &["topic".to_string()])
            .await
            .unwrap();
        let (handler, mut rx) = forwarding();
        consumer.set_handler(handler);

        broker.publish_raw(BusRecord {
            topic: "topic".into(),
            partition: 0,
            key: None,
            value: Some(json!({"bad": true})),
        });
        broker.publish("topic", BusEvent::new("good", None));

        let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.key, "good");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroyed_consumer_stops_delivery() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .create_consumer("g1", &["rooms".to_string()])
            .await
            .unwrap();
        let (handler, mut rx) = forwarding();
        consumer.set_handler(handler);

        consumer.destroy().await.unwrap();
        consumer.destroy().await.unwrap();
        tokio::task::yield_now().await;

        broker.publish("rooms", BusEvent::new("k", None));
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_destroyed_producer_rejects_send() {
        let broker = MemoryBroker::new();
        let producer = broker.create_producer("rooms").await.unwrap();
        producer.destroy().await.unwrap();

        let err = producer.send(vec![BusEvent::new("k", None)]).await.unwrap_err();
        assert!(matches!(err, AppError::Broker(_)));
    }

    #[tokio::test]
    async fn test_admin_sets_partitions() {
        let broker = MemoryBroker::new();
        let admin = broker.create_admin().await.unwrap();

        admin.create_topic("rooms", 3).await.unwrap();
        assert_eq!(broker.partitions("rooms"), Some(3));
        assert!(admin.create_topic("empty", 0).await.is_err());
        admin.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);

        assert!(matches!(
            broker.create_producer("rooms").await,
            Err(AppError::Broker(_))
        ));
        assert!(broker.create_producer("rooms").await.is_ok());
    }

    #[test]
    fn test_partition_for_is_stable() {
        assert_eq!(partition_for("alice", 4), partition_for("alice", 4));
        assert!(partition_for("alice", 4) < 4);
        assert_eq!(partition_for("alice", 0), 0);
    }
}
