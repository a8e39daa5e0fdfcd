use async_trait::async_trait;
use futures_util::stream::StreamExt;
use lapin::{
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer as DeliveryStream,
    ExchangeKind,
};
use std::time::Duration;
use tokio::time::timeout;

use crate::broker::{BrokerError, Consumer, Producer};
use crate::config::BrokerConfig;
use crate::message::{Message, Receipt};

const KEY_HEADER: &str = "x-msgbus-key";
const CONTENT_TYPE_JSON: &str = "application/json";
const PERSISTENT_DELIVERY_MODE: u8 = 2;

const REPLY_SUCCESS: u16 = 200;

/// Queue shared by every consumer of `group_id` on `channel`
pub fn queue_name(group_id: &str, channel: &str) -> String {
    format!("{}.{}", group_id, channel)
}

fn key_from_headers(headers: &Option<FieldTable>) -> Option<Vec<u8>> {
    let h = headers.as_ref()?;
    match h.inner().get(KEY_HEADER)? {
        AMQPValue::LongString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

fn properties_for(key: Option<&[u8]>) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    match key {
        Some(key) => {
            let mut headers = FieldTable::default();
            headers.insert(
                KEY_HEADER.into(),
                AMQPValue::LongString(String::from_utf8_lossy(key).into_owned().into()),
            );
            properties.with_headers(headers)
        }
        None => properties,
    }
}

/// Publishes are mandatory so a message no queue is bound for comes back instead of vanishing
fn publish_options() -> BasicPublishOptions {
    BasicPublishOptions {
        mandatory: true,
        ..BasicPublishOptions::default()
    }
}

/// Maps a publisher confirm to the publish result. Nacks and returned (unroutable) messages
/// are transient: the broker may accept them once a consumer group has bound its queue.
fn confirmation_outcome(channel: &str, confirmation: Confirmation) -> Result<(), BrokerError> {
    let reason = if confirmation.is_nack() {
        "broker rejected the message".to_string()
    } else if let Some(returned) = confirmation.take_message() {
        format!(
            "no queue bound for routing key {}: {} {}",
            channel, returned.reply_code, returned.reply_text
        )
    } else {
        return Ok(());
    };
    Err(BrokerError::PublishFailed {
        channel: channel.to_string(),
        reason,
        transient: true,
    })
}

fn close_failed(address: &str, e: lapin::Error) -> BrokerError {
    BrokerError::CloseFailed {
        address: address.to_string(),
        reason: e.to_string(),
    }
}

/// Opens a connection and channel and declares the durable direct exchange
async fn open_channel(config: &BrokerConfig) -> Result<(Connection, Channel), BrokerError> {
    let address = config.masked_address();

    let connection = timeout(
        config.connect_timeout,
        Connection::connect(&config.address, ConnectionProperties::default()),
    )
    .await
    .map_err(|_| BrokerError::Timeout(format!("Connection to {} timed out", address)))?
    .map_err(|e| BrokerError::ConnectionFailed {
        address: address.clone(),
        reason: e.to_string(),
    })?;

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| BrokerError::ConnectionFailed {
            address: address.clone(),
            reason: format!("failed to open channel: {}", e),
        })?;

    channel
        .exchange_declare(
            config.amqp_exchange.as_str(),
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::ConnectionFailed {
            address,
            reason: format!("failed to declare exchange {}: {}", config.amqp_exchange, e),
        })?;

    Ok((connection, channel))
}

/// RabbitMQ producer; the channel name is the routing key on the configured exchange
pub struct AmqpProducer {
    connection: Connection,
    channel: Channel,
    exchange: String,
    address: String,
    closed: bool,
}

impl AmqpProducer {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let (connection, channel) = open_channel(config).await?;

        // Publisher confirms give every publish a broker-side delivery report.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                address: config.masked_address(),
                reason: format!("failed to enable publisher confirms: {}", e),
            })?;

        Ok(Self {
            connection,
            channel,
            exchange: config.amqp_exchange.clone(),
            address: config.masked_address(),
            closed: false,
        })
    }
}

#[async_trait]
impl Producer for AmqpProducer {
    async fn publish(
        &mut self,
        channel: &str,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let confirm = self
            .channel
            .basic_publish(
                self.exchange.as_str(),
                channel,
                publish_options(),
                value,
                properties_for(key),
            )
            .await
            .map_err(|e| BrokerError::PublishFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
                transient: false,
            })?;

        let confirmation = confirm.await.map_err(|e| BrokerError::PublishFailed {
            channel: channel.to_string(),
            reason: format!("publisher confirm failed: {}", e),
            transient: false,
        })?;

        confirmation_outcome(channel, confirmation)
    }

    async fn flush(&mut self, _timeout: Duration) -> Result<(), BrokerError> {
        // Every publish already waited for its confirm.
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.connection
            .close(REPLY_SUCCESS, "msgbus producer closed")
            .await
            .map_err(|e| close_failed(&self.address, e))
    }

    fn backend(&self) -> &'static str {
        "amqp"
    }
}

/// RabbitMQ consumer. Each group gets one durable queue per channel, so consumers in the
/// same group compete for messages and different groups each receive a copy.
pub struct AmqpConsumer {
    connection: Connection,
    channel: Channel,
    exchange: String,
    address: String,
    group_id: String,
    subscribed: Option<(String, DeliveryStream)>,
    closed: bool,
}

impl AmqpConsumer {
    pub async fn connect(config: &BrokerConfig, group_id: &str) -> Result<Self, BrokerError> {
        let (connection, channel) = open_channel(config).await?;
        Ok(Self {
            connection,
            channel,
            exchange: config.amqp_exchange.clone(),
            address: config.masked_address(),
            group_id: group_id.to_string(),
            subscribed: None,
            closed: false,
        })
    }

    fn subscribe_failed(channel: &str, e: impl std::fmt::Display) -> BrokerError {
        BrokerError::SubscribeFailed {
            channel: channel.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let queue_name = queue_name(&self.group_id, channel);

        // Declare queue with non-exclusive, durable settings
        let queue = self
            .channel
            .queue_declare(
                queue_name.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Self::subscribe_failed(channel, e))?;

        self.channel
            .queue_bind(
                queue.name().as_str(),
                self.exchange.as_str(),
                channel,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                Self::subscribe_failed(
                    channel,
                    format!(
                        "failed to bind queue {} to exchange {}: {}",
                        queue_name, self.exchange, e
                    ),
                )
            })?;

        // The subscriber handles one message at a time.
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| Self::subscribe_failed(channel, format!("failed to set QoS: {}", e)))?;

        let deliveries = self
            .channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions {
                    no_ack: false, // Manual ack
                    exclusive: false,
                    no_local: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Self::subscribe_failed(channel, e))?;

        log::info!(
            "amqp subscribed exchange={} queue={} routing_key={}",
            self.exchange,
            queue_name,
            channel
        );
        self.subscribed = Some((channel.to_string(), deliveries));
        Ok(())
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<Message>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let (channel, deliveries) = self.subscribed.as_mut().ok_or(BrokerError::NotSubscribed)?;

        let delivery = match timeout(wait, deliveries.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                return Err(BrokerError::Delivery {
                    channel: channel.clone(),
                    reason: "consumer was cancelled by the broker".to_string(),
                    transient: false,
                })
            }
            Ok(Some(Err(e))) => {
                return Err(BrokerError::Delivery {
                    channel: channel.clone(),
                    reason: e.to_string(),
                    transient: false,
                })
            }
            Ok(Some(Ok(delivery))) => delivery,
        };

        Ok(Some(Message {
            channel: delivery.routing_key.to_string(),
            key: key_from_headers(delivery.properties.headers()),
            timestamp: delivery
                .properties
                .timestamp()
                .as_ref()
                .map(|ts| *ts as i64),
            receipt: Receipt::Amqp {
                delivery_tag: delivery.delivery_tag,
            },
            value: delivery.data,
        }))
    }

    async fn ack(&mut self, message: &Message) -> Result<(), BrokerError> {
        let Receipt::Amqp { delivery_tag } = message.receipt else {
            return Err(BrokerError::AckFailed(format!(
                "receipt {:?} does not belong to the amqp broker",
                message.receipt
            )));
        };
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| {
                BrokerError::AckFailed(format!(
                    "routing_key={} delivery_tag={}: {}",
                    message.channel, delivery_tag, e
                ))
            })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.subscribed = None;
        // Closing the connection requeues any delivery that was not acked.
        self.connection
            .close(REPLY_SUCCESS, "msgbus consumer closed")
            .await
            .map_err(|e| close_failed(&self.address, e))
    }

    fn backend(&self) -> &'static str {
        "amqp"
    }
}
