//! In-process queue driver.
//!
//! Routes each published event to every started consumer subscribed to its
//! topic. One `MemoryConsumer` models one group channel, so "every
//! subscribed consumer" gives the same per-group delivery a real backend
//! provides. Request/reply is loopback: the caller receives its own event
//! back once a route exists, which is enough for standalone mode and tests.

use super::{
    CommitAction, ConsumeContext, EventListener, MeshQueueConsumer, MeshQueueProducer,
    QueueClientConfig, QueueDriver, QueueError, ReplyCallback, SendCallback,
};
use crate::protocol::MeshEvent;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Shared routing table and commit counters for one in-process "cluster".
#[derive(Default)]
pub struct MemoryBroker {
    consumers: Mutex<Vec<Weak<ConsumerInner>>>,
    manual_acks: AtomicU64,
    immediate_commits: AtomicU64,
}

impl MemoryBroker {
    fn attach(&self, consumer: &Arc<ConsumerInner>) {
        let mut consumers = self.consumers.lock();
        consumers.retain(|c| c.upgrade().is_some());
        consumers.push(Arc::downgrade(consumer));
    }

    /// Started consumers subscribed to the topic, with their listeners.
    fn route(&self, topic: &str) -> Vec<(Arc<dyn EventListener>, Arc<ConsumerInner>)> {
        let consumers = self.consumers.lock();
        let mut targets = Vec::new();
        for weak in &*consumers {
            let Some(inner) = weak.upgrade() else {
                continue;
            };
            if !inner.started.load(Ordering::SeqCst) {
                continue;
            }
            if !inner.topics.lock().contains(topic) {
                continue;
            }
            let listener = inner.listener.lock().clone();
            if let Some(listener) = listener {
                targets.push((listener, inner));
            }
        }
        targets
    }

    fn record_commit(&self, action: CommitAction) {
        match action {
            CommitAction::ManualAck => self.manual_acks.fetch_add(1, Ordering::SeqCst),
            CommitAction::CommitMessage => self.immediate_commits.fetch_add(1, Ordering::SeqCst),
        };
    }

    /// Consumes committed with `ManualAck` (broker-owned redelivery).
    pub fn manual_acks(&self) -> u64 {
        self.manual_acks.load(Ordering::SeqCst)
    }

    /// Consumes committed with `CommitMessage`.
    pub fn immediate_commits(&self) -> u64 {
        self.immediate_commits.load(Ordering::SeqCst)
    }
}

struct ConsumerInner {
    broker: Arc<MemoryBroker>,
    topics: Mutex<HashSet<String>>,
    listener: Mutex<Option<Arc<dyn EventListener>>>,
    started: AtomicBool,
}

/// Consumer half of the in-process driver.
pub struct MemoryConsumer {
    inner: Arc<ConsumerInner>,
}

impl MeshQueueConsumer for MemoryConsumer {
    fn init(&self, _cfg: &QueueClientConfig) -> Result<(), QueueError> {
        Ok(())
    }

    fn start(&self) -> Result<(), QueueError> {
        if self.inner.listener.lock().is_none() {
            return Err(QueueError::NoListener);
        }
        self.inner.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), QueueError> {
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.topics.lock().clear();
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), QueueError> {
        self.inner.topics.lock().insert(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), QueueError> {
        self.inner.topics.lock().remove(topic);
        Ok(())
    }

    fn register_listener(&self, listener: Arc<dyn EventListener>) -> Result<(), QueueError> {
        *self.inner.listener.lock() = Some(listener);
        Ok(())
    }
}

/// Producer half of the in-process driver.
pub struct MemoryProducer {
    broker: Arc<MemoryBroker>,
    started: AtomicBool,
}

impl MemoryProducer {
    fn deliver_all(&self, event: &MeshEvent) -> usize {
        let targets = self.broker.route(&event.topic);
        let delivered = targets.len();
        for (listener, inner) in targets {
            let event = event.clone();
            let broker = inner.broker.clone();
            let ctx = ConsumeContext::new(move |action| broker.record_commit(action));
            // Deliver off the caller's stack so a listener that sends back
            // into the broker cannot recurse through the routing lock.
            tokio::spawn(async move {
                listener.on_event(event, ctx);
            });
        }
        delivered
    }
}

impl MeshQueueProducer for MemoryProducer {
    fn init(&self, _cfg: &QueueClientConfig) -> Result<(), QueueError> {
        Ok(())
    }

    fn start(&self) -> Result<(), QueueError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), QueueError> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, event: MeshEvent, callback: SendCallback) -> Result<(), QueueError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(QueueError::NotStarted);
        }
        let delivered = self.deliver_all(&event);
        if delivered == 0 {
            callback(Err(QueueError::NoRoute(event.topic)));
        } else {
            callback(Ok(()));
        }
        Ok(())
    }

    fn request(
        &self,
        event: MeshEvent,
        callback: ReplyCallback,
        _timeout: Duration,
    ) -> Result<(), QueueError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(QueueError::NotStarted);
        }
        let delivered = self.deliver_all(&event);
        if delivered == 0 {
            callback(Err(QueueError::NoRoute(event.topic)));
        } else {
            callback(Ok(event));
        }
        Ok(())
    }
}

/// Queue driver backed by a single shared [`MemoryBroker`].
#[derive(Clone, Default)]
pub struct MemoryQueueDriver {
    broker: Arc<MemoryBroker>,
}

impl MemoryQueueDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }
}

impl QueueDriver for MemoryQueueDriver {
    fn create_producer(&self) -> Arc<dyn MeshQueueProducer> {
        Arc::new(MemoryProducer {
            broker: self.broker.clone(),
            started: AtomicBool::new(false),
        })
    }

    fn create_consumer(&self) -> Arc<dyn MeshQueueConsumer> {
        let inner = Arc::new(ConsumerInner {
            broker: self.broker.clone(),
            topics: Mutex::new(HashSet::new()),
            listener: Mutex::new(None),
            started: AtomicBool::new(false),
        });
        self.broker.attach(&inner);
        Arc::new(MemoryConsumer { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingListener {
        seen: Arc<AtomicU32>,
    }

    impl EventListener for CountingListener {
        fn on_event(&self, _event: MeshEvent, ctx: ConsumeContext) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            ctx.commit(CommitAction::CommitMessage);
        }
    }

    fn test_config(group: &str) -> QueueClientConfig {
        QueueClientConfig {
            group: group.to_string(),
            instance_name: format!("{group}-test"),
            idc: "local".to_string(),
            broadcast: false,
        }
    }

    #[tokio::test]
    async fn test_routes_to_subscribed_consumer() {
        let driver = MemoryQueueDriver::new();
        let consumer = driver.create_consumer();
        let producer = driver.create_producer();

        let seen = Arc::new(AtomicU32::new(0));
        consumer
            .register_listener(Arc::new(CountingListener { seen: seen.clone() }))
            .unwrap();
        consumer.init(&test_config("g1")).unwrap();
        consumer.subscribe("t1").unwrap();
        consumer.start().unwrap();

        producer.init(&test_config("g1")).unwrap();
        producer.start().unwrap();
        producer
            .send(MeshEvent::new("t1", Vec::new()), Box::new(|r| r.unwrap()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(driver.broker().immediate_commits(), 1);
    }

    #[tokio::test]
    async fn test_no_route_reported_via_callback() {
        let driver = MemoryQueueDriver::new();
        let producer = driver.create_producer();
        producer.start().unwrap();

        let failed = Arc::new(AtomicU32::new(0));
        let f = failed.clone();
        producer
            .send(
                MeshEvent::new("nowhere", Vec::new()),
                Box::new(move |r| {
                    assert!(matches!(r, Err(QueueError::NoRoute(_))));
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_topic_not_delivered() {
        let driver = MemoryQueueDriver::new();
        let consumer = driver.create_consumer();
        let producer = driver.create_producer();

        let seen = Arc::new(AtomicU32::new(0));
        consumer
            .register_listener(Arc::new(CountingListener { seen: seen.clone() }))
            .unwrap();
        consumer.subscribe("t1").unwrap();
        consumer.start().unwrap();
        consumer.unsubscribe("t1").unwrap();

        producer.start().unwrap();
        producer
            .send(
                MeshEvent::new("t1", Vec::new()),
                Box::new(|r| assert!(r.is_err())),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_requires_listener() {
        let driver = MemoryQueueDriver::new();
        let consumer = driver.create_consumer();
        assert!(matches!(consumer.start(), Err(QueueError::NoListener)));
    }
}
