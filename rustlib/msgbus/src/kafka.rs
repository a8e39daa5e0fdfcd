use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::{Message as _, Offset, TopicPartitionList};
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio::{task::spawn_blocking, time::timeout};

use crate::broker::{BrokerError, Consumer, Producer};
use crate::config::BrokerConfig;
use crate::message::{Message, Receipt};

/// How long `send` may wait for room in librdkafka's local queue
const QUEUE_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Base client configuration shared by producers and consumers
fn client_config(config: &BrokerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.address)
        .set("security.protocol", "plaintext")
        .set(
            "socket.connection.setup.timeout.ms",
            config.connect_timeout.as_millis().to_string(),
        );
    client_config
}

/// Errors a healthy cluster recovers from on its own (leader moves, timeouts, full queues)
pub fn is_transient(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::PartitionEOF
        )
    )
}

fn connection_failed(address: &str, e: impl Display) -> BrokerError {
    BrokerError::ConnectionFailed {
        address: address.to_string(),
        reason: e.to_string(),
    }
}

/// Runs a blocking librdkafka call on tokio's blocking pool
async fn off_runtime<T, F>(call: F) -> Result<KafkaResult<T>, tokio::task::JoinError>
where
    F: FnOnce() -> KafkaResult<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(call).await
}

/// Kafka producer. `acks=all` plus idempotence, and every publish awaits its delivery report.
pub struct KafkaProducer {
    producer: FutureProducer,
    address: String,
    closed: bool,
}

impl KafkaProducer {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let address = config.masked_address();
        let producer: FutureProducer = client_config(config)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("linger.ms", "10")
            .set("request.timeout.ms", "30000")
            .set("delivery.timeout.ms", "120000")
            .create()
            .map_err(|e| connection_failed(&address, e))?;

        // Creating the client never touches the network; a metadata round trip does.
        let handle = producer.clone();
        let connect_timeout = config.connect_timeout;
        off_runtime(move || handle.client().fetch_metadata(None, connect_timeout))
            .await
            .map_err(|e| connection_failed(&address, e))?
            .map_err(|e| connection_failed(&address, e))?;

        Ok(Self {
            producer,
            address,
            closed: false,
        })
    }

    async fn flush_for(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        match off_runtime(move || producer.flush(Timeout::After(timeout))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::Timeout(format!("kafka flush: {}", e))),
            Err(e) => Err(BrokerError::CloseFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn publish(
        &mut self,
        channel: &str,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let mut record = FutureRecord::<[u8], [u8]>::to(channel).payload(value);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.producer.send(record, Timeout::After(QUEUE_TIMEOUT)).await {
            Ok((partition, offset)) => {
                log::debug!(
                    "kafka delivered topic={} partition={} offset={}",
                    channel,
                    partition,
                    offset
                );
                Ok(())
            }
            Err((e, _)) => Err(BrokerError::PublishFailed {
                channel: channel.to_string(),
                transient: is_transient(&e),
                reason: e.to_string(),
            }),
        }
    }

    async fn flush(&mut self, timeout: Duration) -> Result<(), BrokerError> {
        self.flush_for(timeout).await
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_for(CLOSE_FLUSH_TIMEOUT).await
    }

    fn backend(&self) -> &'static str {
        "kafka"
    }
}

/// Kafka consumer in a consumer group. Offsets are stored only for acknowledged messages and
/// committed in the background, so a crash replays at most the unacknowledged tail.
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    address: String,
    channel: Option<String>,
    closed: bool,
}

impl KafkaConsumer {
    pub async fn connect(config: &BrokerConfig, group_id: &str) -> Result<Self, BrokerError> {
        let address = config.masked_address();
        let consumer: StreamConsumer = client_config(config)
            .set("group.id", group_id)
            // Offset management
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            // Session management
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .create()
            .map_err(|e| connection_failed(&address, e))?;
        let consumer = Arc::new(consumer);

        let handle = Arc::clone(&consumer);
        let connect_timeout = config.connect_timeout;
        off_runtime(move || handle.fetch_metadata(None, connect_timeout))
            .await
            .map_err(|e| connection_failed(&address, e))?
            .map_err(|e| connection_failed(&address, e))?;

        Ok(Self {
            consumer,
            address,
            channel: None,
            closed: false,
        })
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.consumer
            .subscribe(&[channel])
            .map_err(|e| BrokerError::SubscribeFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        self.channel = Some(channel.to_string());
        Ok(())
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<Message>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let channel = self.channel.as_deref().ok_or(BrokerError::NotSubscribed)?;

        match timeout(wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(BrokerError::Delivery {
                channel: channel.to_string(),
                transient: is_transient(&e),
                reason: e.to_string(),
            }),
            Ok(Ok(m)) => Ok(Some(Message {
                channel: m.topic().to_string(),
                key: m.key().map(<[u8]>::to_vec),
                value: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                timestamp: m.timestamp().to_millis(),
                receipt: Receipt::Kafka {
                    partition: m.partition(),
                    offset: m.offset(),
                },
            })),
        }
    }

    async fn ack(&mut self, message: &Message) -> Result<(), BrokerError> {
        let Receipt::Kafka { partition, offset } = message.receipt else {
            return Err(BrokerError::AckFailed(format!(
                "receipt {:?} does not belong to the kafka broker",
                message.receipt
            )));
        };

        // The stored offset is the next one to read.
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&message.channel, partition, Offset::Offset(offset + 1))
            .map_err(|e| BrokerError::AckFailed(e.to_string()))?;
        self.consumer
            .store_offsets(&tpl)
            .map_err(|e| BrokerError::AckFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let consumer = Arc::clone(&self.consumer);
        let committed = off_runtime(move || {
            let committed = consumer.commit_consumer_state(CommitMode::Sync);
            consumer.unsubscribe();
            committed
        })
        .await
        .map_err(|e| BrokerError::CloseFailed {
            address: self.address.clone(),
            reason: e.to_string(),
        })?;
        if let Err(e) = committed {
            // Nothing stored since the last auto-commit is reported as an error too.
            log::debug!("kafka final commit skipped: {}", e);
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "kafka"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(is_transient(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(is_transient(&KafkaError::MessageProduction(
            RDKafkaErrorCode::QueueFull
        )));
        assert!(!is_transient(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
        )));
        assert!(!is_transient(&KafkaError::Canceled));
    }

    /// Counts 10ms ticks on the current runtime until dropped
    fn ticker() -> (Arc<std::sync::atomic::AtomicU32>, tokio::task::JoinHandle<()>) {
        let ticks = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });
        (ticks, handle)
    }

    fn unreachable() -> BrokerConfig {
        BrokerConfig {
            connect_timeout: Duration::from_millis(500),
            ..BrokerConfig::new("127.0.0.1:1")
        }
    }

    #[tokio::test]
    async fn test_connect_leaves_runtime_free() {
        let (ticks, handle) = ticker();
        let started = std::time::Instant::now();

        let err = KafkaProducer::connect(&unreachable()).await.err().unwrap();
        assert!(matches!(err, BrokerError::ConnectionFailed { .. }));
        let err = KafkaConsumer::connect(&unreachable(), "jmsgroup")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::ConnectionFailed { .. }));

        let elapsed = started.elapsed();
        handle.abort();
        // The ticker only advances if the single runtime thread was never blocked.
        if elapsed >= Duration::from_millis(200) {
            assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) >= 5);
        }
    }

    #[test]
    fn test_client_config() {
        let config = BrokerConfig {
            connect_timeout: Duration::from_millis(1500),
            ..BrokerConfig::new("k1:9092,k2:9092")
        };
        let client_config = client_config(&config);
        assert_eq!(client_config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(
            client_config.get("socket.connection.setup.timeout.ms"),
            Some("1500")
        );
    }
}
