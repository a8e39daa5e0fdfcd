use async_trait::async_trait;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio::time::sleep;

use crate::amqp::{AmqpConsumer, AmqpProducer};
use crate::config::BrokerConfig;
use crate::memory::MemoryBroker;
use crate::message::Message;

const MEMORY_SCHEME: &str = "memory://";

const INITIAL_CONNECT_BACKOFF: Duration = Duration::from_millis(250);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Whether retrying the failed operation can succeed without operator action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Fatal,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Unsupported broker address: {0}")]
    UnsupportedAddress(String),
    #[error("Failed to connect to broker at {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },
    #[error("Context timeout: {0}")]
    Timeout(String),
    #[error("Failed to subscribe to channel {channel}: {reason}")]
    SubscribeFailed { channel: String, reason: String },
    #[error("Consumer is not subscribed to a channel")]
    NotSubscribed,
    #[error("Failed to publish to channel {channel}: {reason}")]
    PublishFailed {
        channel: String,
        reason: String,
        transient: bool,
    },
    #[error("Delivery error on channel {channel}: {reason}")]
    Delivery {
        channel: String,
        reason: String,
        transient: bool,
    },
    #[error("Failed to acknowledge message: {0}")]
    AckFailed(String),
    #[error("Connection handle is closed")]
    Closed,
    #[error("Failed to close connection to {address}: {reason}")]
    CloseFailed { address: String, reason: String },
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::PublishFailed {
                transient: true, ..
            }
            | BrokerError::Delivery {
                transient: true, ..
            }
            | BrokerError::Timeout(_) => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Publish-only session with a broker
#[async_trait]
pub trait Producer: Send {
    /// Submits one message and waits for the broker's delivery report.
    async fn publish(
        &mut self,
        channel: &str,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(), BrokerError>;

    /// Waits for in-flight messages to be acknowledged by the broker.
    async fn flush(&mut self, timeout: Duration) -> Result<(), BrokerError>;

    /// Releases the session. Calling it twice is a no-op.
    async fn close(&mut self) -> Result<(), BrokerError>;

    fn backend(&self) -> &'static str;
}

/// Subscribe-only session with a broker
#[async_trait]
pub trait Consumer: Send {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BrokerError>;

    /// Waits at most `timeout` for the next message. `Ok(None)` means nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError>;

    /// Marks the message as processed so it is not redelivered to this group.
    async fn ack(&mut self, message: &Message) -> Result<(), BrokerError>;

    /// Releases the session. Un-acknowledged messages become eligible for redelivery.
    async fn close(&mut self) -> Result<(), BrokerError>;

    fn backend(&self) -> &'static str;
}

/// Backend selected from the broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerKind {
    Amqp,
    Kafka,
    Memory(String),
}

impl BrokerKind {
    pub fn from_address(address: &str) -> Result<Self, BrokerError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(BrokerError::UnsupportedAddress("empty address".to_string()));
        }
        if let Some(name) = address.strip_prefix(MEMORY_SCHEME) {
            if name.is_empty() {
                return Err(BrokerError::UnsupportedAddress(address.to_string()));
            }
            return Ok(BrokerKind::Memory(name.to_string()));
        }
        if address.starts_with("amqp://") || address.starts_with("amqps://") {
            return Ok(BrokerKind::Amqp);
        }
        if address.contains("://") {
            return Err(BrokerError::UnsupportedAddress(address.to_string()));
        }
        // Plain host:port lists are Kafka bootstrap servers.
        Ok(BrokerKind::Kafka)
    }
}

/// Acquires a publish-only connection handle
pub async fn connect_producer(config: &BrokerConfig) -> Result<Box<dyn Producer>, BrokerError> {
    let kind = BrokerKind::from_address(&config.address)?;
    let kind = &kind;
    let producer = with_connect_retries(config, "producer", || async move {
        let producer: Box<dyn Producer> = match kind {
            BrokerKind::Memory(name) => Box::new(MemoryBroker::lookup(name)?.producer()),
            BrokerKind::Amqp => Box::new(AmqpProducer::connect(config).await?),
            BrokerKind::Kafka => connect_kafka_producer(config).await?,
        };
        Ok::<_, BrokerError>(producer)
    })
    .await?;

    log::info!(
        "Connected producer to broker {} backend={}",
        config.masked_address(),
        producer.backend()
    );
    Ok(producer)
}

/// Acquires a subscribe-only connection handle for the given consumer group
pub async fn connect_consumer(
    config: &BrokerConfig,
    group_id: &str,
) -> Result<Box<dyn Consumer>, BrokerError> {
    let kind = BrokerKind::from_address(&config.address)?;
    let kind = &kind;
    let consumer = with_connect_retries(config, "consumer", || async move {
        let consumer: Box<dyn Consumer> = match kind {
            BrokerKind::Memory(name) => Box::new(MemoryBroker::lookup(name)?.consumer(group_id)),
            BrokerKind::Amqp => Box::new(AmqpConsumer::connect(config, group_id).await?),
            BrokerKind::Kafka => connect_kafka_consumer(config, group_id).await?,
        };
        Ok::<_, BrokerError>(consumer)
    })
    .await?;

    log::info!(
        "Connected consumer to broker {} backend={} group={}",
        config.masked_address(),
        consumer.backend(),
        group_id
    );
    Ok(consumer)
}

async fn with_connect_retries<T, F, Fut>(
    config: &BrokerConfig,
    role: &str,
    mut attempt: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut backoff = INITIAL_CONNECT_BACKOFF;
    let mut retries = 0u32;
    loop {
        match attempt().await {
            Ok(handle) => return Ok(handle),
            Err(e @ BrokerError::UnsupportedAddress(_)) => return Err(e),
            Err(e) if retries < config.connect_retries => {
                retries += 1;
                log::warn!(
                    "msgbus: {} connect failed; address={} err={} retry={}/{} retry_in_ms={}",
                    role,
                    config.masked_address(),
                    e,
                    retries,
                    config.connect_retries,
                    backoff.as_millis()
                );
                sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), MAX_CONNECT_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(feature = "kafka")]
async fn connect_kafka_producer(config: &BrokerConfig) -> Result<Box<dyn Producer>, BrokerError> {
    Ok(Box::new(
        crate::kafka::KafkaProducer::connect(config).await?,
    ))
}

#[cfg(not(feature = "kafka"))]
async fn connect_kafka_producer(config: &BrokerConfig) -> Result<Box<dyn Producer>, BrokerError> {
    Err(kafka_disabled(config))
}

#[cfg(feature = "kafka")]
async fn connect_kafka_consumer(
    config: &BrokerConfig,
    group_id: &str,
) -> Result<Box<dyn Consumer>, BrokerError> {
    Ok(Box::new(
        crate::kafka::KafkaConsumer::connect(config, group_id).await?,
    ))
}

#[cfg(not(feature = "kafka"))]
async fn connect_kafka_consumer(
    config: &BrokerConfig,
    _group_id: &str,
) -> Result<Box<dyn Consumer>, BrokerError> {
    Err(kafka_disabled(config))
}

#[cfg(not(feature = "kafka"))]
fn kafka_disabled(config: &BrokerConfig) -> BrokerError {
    BrokerError::UnsupportedAddress(format!(
        "{} (built without the `kafka` feature)",
        config.address
    ))
}
