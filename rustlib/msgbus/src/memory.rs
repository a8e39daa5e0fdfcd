//! In-process broker with Kafka-like semantics: every channel is an append-only log, each
//! consumer group keeps its own position, and acknowledged offsets survive the consumer.
//!
//! Brokers are reachable through `memory://<name>` addresses once registered with
//! [`MemoryBroker::register`].

use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};
use tokio::{sync::Notify, time::timeout};

use crate::broker::{BrokerError, Consumer, Producer};
use crate::message::{Message, Receipt};

static REGISTRY: OnceLock<Mutex<HashMap<String, MemoryBroker>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, MemoryBroker>> {
    REGISTRY.get_or_init(Default::default)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error handed to the next consumer that polls the channel
#[derive(Debug, Clone)]
pub struct DeliveryFault {
    pub reason: String,
    pub transient: bool,
}

impl DeliveryFault {
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: false,
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: true,
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    timestamp: i64,
}

type GroupChannel = (String, String);

#[derive(Default)]
struct State {
    logs: HashMap<String, Vec<Record>>,
    /// Next offset handed out to the group
    cursors: HashMap<GroupChannel, usize>,
    /// Everything below this offset is acknowledged by the group
    committed: HashMap<GroupChannel, usize>,
    faults: HashMap<String, VecDeque<DeliveryFault>>,
    open_handles: usize,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    published: Notify,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Unregistered broker, only reachable through its handles
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the broker registered under `name`, creating it on first use
    pub fn register(name: &str) -> Self {
        lock(registry())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn unregister(name: &str) -> Option<Self> {
        lock(registry()).remove(name)
    }

    /// Resolves a registered broker, failing like an unreachable network broker otherwise
    pub fn lookup(name: &str) -> Result<Self, BrokerError> {
        lock(registry())
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::ConnectionFailed {
                address: Self::address(name),
                reason: "no in-memory broker registered under this name".to_string(),
            })
    }

    pub fn address(name: &str) -> String {
        format!("memory://{}", name)
    }

    pub fn producer(&self) -> MemoryProducer {
        lock(&self.inner.state).open_handles += 1;
        MemoryProducer {
            broker: self.clone(),
            closed: false,
        }
    }

    pub fn consumer(&self, group_id: &str) -> MemoryConsumer {
        lock(&self.inner.state).open_handles += 1;
        MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            channel: None,
            closed: false,
        }
    }

    /// Queues a broker-side error for the channel; it is delivered before any further message
    pub fn inject_delivery_error(&self, channel: &str, fault: DeliveryFault) {
        lock(&self.inner.state)
            .faults
            .entry(channel.to_string())
            .or_default()
            .push_back(fault);
        self.inner.published.notify_waiters();
    }

    /// Snapshot of everything published to the channel
    pub fn messages(&self, channel: &str) -> Vec<Message> {
        let state = lock(&self.inner.state);
        state
            .logs
            .get(channel)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, record)| record.to_message(channel, offset))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, channel: &str) -> usize {
        lock(&self.inner.state)
            .logs
            .get(channel)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, channel: &str) -> bool {
        self.len(channel) == 0
    }

    /// Producers and consumers connected and not yet released
    pub fn open_handles(&self) -> usize {
        lock(&self.inner.state).open_handles
    }

    fn append(&self, channel: &str, key: Option<&[u8]>, value: &[u8]) {
        {
            let mut state = lock(&self.inner.state);
            state
                .logs
                .entry(channel.to_string())
                .or_default()
                .push(Record {
                    key: key.map(<[u8]>::to_vec),
                    value: value.to_vec(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
        }
        self.inner.published.notify_waiters();
    }

    fn take_next(&self, group_id: &str, channel: &str) -> Option<Result<Message, BrokerError>> {
        let mut state = lock(&self.inner.state);

        if let Some(fault) = state.faults.get_mut(channel).and_then(VecDeque::pop_front) {
            return Some(Err(BrokerError::Delivery {
                channel: channel.to_string(),
                reason: fault.reason,
                transient: fault.transient,
            }));
        }

        let position = (group_id.to_string(), channel.to_string());
        let committed = state.committed.get(&position).copied().unwrap_or(0);
        let cursor = *state.cursors.entry(position.clone()).or_insert(committed);
        let record = state.logs.get(channel)?.get(cursor)?.clone();
        state.cursors.insert(position, cursor + 1);

        Some(Ok(record.to_message(channel, cursor)))
    }

    fn commit(&self, group_id: &str, channel: &str, offset: usize) {
        let mut state = lock(&self.inner.state);
        let committed = state
            .committed
            .entry((group_id.to_string(), channel.to_string()))
            .or_insert(0);
        *committed = (*committed).max(offset + 1);
    }

    /// Hands un-acknowledged messages of the group back out on the next poll
    fn rewind(&self, group_id: &str, channel: &str) {
        let mut state = lock(&self.inner.state);
        let position = (group_id.to_string(), channel.to_string());
        let committed = state.committed.get(&position).copied().unwrap_or(0);
        state.cursors.insert(position, committed);
    }

    fn release(&self) {
        let mut state = lock(&self.inner.state);
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

impl Record {
    fn to_message(&self, channel: &str, offset: usize) -> Message {
        Message {
            channel: channel.to_string(),
            key: self.key.clone(),
            value: self.value.clone(),
            timestamp: Some(self.timestamp),
            receipt: Receipt::Memory { offset },
        }
    }
}

pub struct MemoryProducer {
    broker: MemoryBroker,
    closed: bool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn publish(
        &mut self,
        channel: &str,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.broker.append(channel, key, value);
        Ok(())
    }

    async fn flush(&mut self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.closed = true;
            self.broker.release();
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

impl Drop for MemoryProducer {
    fn drop(&mut self) {
        if !self.closed {
            self.broker.release();
        }
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    channel: Option<String>,
    closed: bool,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.channel = Some(channel.to_string());
        Ok(())
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<Message>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let channel = self.channel.as_deref().ok_or(BrokerError::NotSubscribed)?;
        let (broker, group_id) = (&self.broker, self.group_id.as_str());

        let next = async {
            loop {
                // Registered before the check so a publish in between still wakes us.
                let published = broker.inner.published.notified();
                if let Some(next) = broker.take_next(group_id, channel) {
                    return next;
                }
                published.await;
            }
        };

        match timeout(wait, next).await {
            Ok(next) => next.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&mut self, message: &Message) -> Result<(), BrokerError> {
        match message.receipt {
            Receipt::Memory { offset } => {
                self.broker.commit(&self.group_id, &message.channel, offset);
                Ok(())
            }
            other => Err(BrokerError::AckFailed(format!(
                "receipt {:?} does not belong to the in-memory broker",
                other
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(channel) = &self.channel {
            self.broker.rewind(&self.group_id, channel);
        }
        self.broker.release();
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(channel) = &self.channel {
                self.broker.rewind(&self.group_id, channel);
            }
            self.broker.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_poll() {
        let broker = MemoryBroker::new();
        let mut producer = broker.producer();
        let mut consumer = broker.consumer("jmsgroup");
        consumer.subscribe("test").await.unwrap();

        producer
            .publish("test", Some(b"test"), br#"{"a":1}"#)
            .await
            .unwrap();

        let msg = consumer.poll(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(msg.channel, "test");
        assert_eq!(msg.key.as_deref(), Some(&b"test"[..]));
        assert_eq!(msg.value, br#"{"a":1}"#);
        assert_eq!(msg.receipt, Receipt::Memory { offset: 0 });
        assert!(msg.timestamp.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_without_messages() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("jmsgroup");
        consumer.subscribe("test").await.unwrap();

        let started = tokio::time::Instant::now();
        let polled = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert!(polled.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_accepts_timeouts_past_the_clock_range() {
        let broker = MemoryBroker::new();
        broker.producer().publish("test", None, b"queued").await.unwrap();
        let mut consumer = broker.consumer("jmsgroup");
        consumer.subscribe("test").await.unwrap();

        let msg = consumer.poll(Duration::MAX).await.unwrap().unwrap();
        assert_eq!(msg.value, b"queued");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            publisher
                .producer()
                .publish("test", None, b"later")
                .await
                .unwrap();
        });
        let msg = consumer.poll(Duration::MAX).await.unwrap().unwrap();
        assert_eq!(msg.value, b"later");
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("jmsgroup");
        consumer.subscribe("test").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .producer()
                .publish("test", None, b"late")
                .await
                .unwrap();
        });

        let msg = consumer.poll(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(msg.value, b"late");
    }

    #[tokio::test]
    async fn test_poll_requires_subscription() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("jmsgroup");
        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotSubscribed));
    }

    #[tokio::test]
    async fn test_groups_share_or_duplicate_channel() {
        let broker = MemoryBroker::new();
        let mut producer = broker.producer();
        for i in 0..4u8 {
            producer.publish("test", None, &[i]).await.unwrap();
        }

        let mut first = broker.consumer("shared");
        let mut second = broker.consumer("shared");
        let mut other = broker.consumer("other");
        for consumer in [&mut first, &mut second, &mut other] {
            consumer.subscribe("test").await.unwrap();
        }

        let timeout = Duration::from_millis(10);
        let mut shared = Vec::new();
        for _ in 0..2 {
            shared.push(first.poll(timeout).await.unwrap().unwrap().value[0]);
            shared.push(second.poll(timeout).await.unwrap().unwrap().value[0]);
        }
        shared.sort_unstable();
        assert_eq!(shared, vec![0, 1, 2, 3]);
        assert!(first.poll(timeout).await.unwrap().is_none());

        let mut everything = Vec::new();
        while let Some(msg) = other.poll(timeout).await.unwrap() {
            everything.push(msg.value[0]);
        }
        assert_eq!(everything, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered_after_close() {
        let broker = MemoryBroker::new();
        let mut producer = broker.producer();
        producer.publish("test", None, b"one").await.unwrap();
        producer.publish("test", None, b"two").await.unwrap();

        let timeout = Duration::from_millis(10);
        let mut consumer = broker.consumer("jmsgroup");
        consumer.subscribe("test").await.unwrap();
        let one = consumer.poll(timeout).await.unwrap().unwrap();
        consumer.ack(&one).await.unwrap();
        let two = consumer.poll(timeout).await.unwrap().unwrap();
        assert_eq!(two.value, b"two");
        consumer.close().await.unwrap();

        let mut restarted = broker.consumer("jmsgroup");
        restarted.subscribe("test").await.unwrap();
        let again = restarted.poll(timeout).await.unwrap().unwrap();
        assert_eq!(again.value, b"two");
        assert_eq!(again.receipt, Receipt::Memory { offset: 1 });
    }

    #[tokio::test]
    async fn test_injected_fault_precedes_messages() {
        let broker = MemoryBroker::new();
        broker.producer().publish("test", None, b"after").await.unwrap();
        broker.inject_delivery_error("test", DeliveryFault::transient("leader moved"));

        let mut consumer = broker.consumer("jmsgroup");
        consumer.subscribe("test").await.unwrap();
        let timeout = Duration::from_millis(10);

        match consumer.poll(timeout).await {
            Err(BrokerError::Delivery {
                reason, transient, ..
            }) => {
                assert_eq!(reason, "leader moved");
                assert!(transient);
            }
            other => panic!("expected delivery error, got {:?}", other),
        }
        let msg = consumer.poll(timeout).await.unwrap().unwrap();
        assert_eq!(msg.value, b"after");
    }

    #[tokio::test]
    async fn test_handles_are_released() {
        let broker = MemoryBroker::new();
        let mut producer = broker.producer();
        let consumer = broker.consumer("jmsgroup");
        assert_eq!(broker.open_handles(), 2);

        producer.close().await.unwrap();
        producer.close().await.unwrap();
        assert_eq!(broker.open_handles(), 1);
        assert!(matches!(
            producer.publish("test", None, b"x").await,
            Err(BrokerError::Closed)
        ));

        drop(consumer);
        assert_eq!(broker.open_handles(), 0);
    }

    #[test]
    fn test_registry_lookup() {
        let name = "memory-test-registry";
        assert!(MemoryBroker::lookup(name).is_err());
        let registered = MemoryBroker::register(name);
        let found = MemoryBroker::lookup(name).unwrap();
        let _producer = found.producer();
        assert_eq!(registered.open_handles(), 1);
        assert!(MemoryBroker::unregister(name).is_some());
        assert!(MemoryBroker::lookup(name).is_err());
    }
}
