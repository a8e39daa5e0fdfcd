use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, Consumer};
use crate::config::SubscriberConfig;
use crate::message::Message;

/// Pause before polling again after a skipped transient delivery error
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error("Failed to subscribe: {0}")]
    Subscribe(#[source] BrokerError),
    #[error("Delivery failed: {0}")]
    Delivery(#[source] BrokerError),
    #[error("Error processing message from channel {channel}: {source}")]
    Callback {
        channel: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Failed to acknowledge message: {0}")]
    Ack(#[source] BrokerError),
    #[error("Failed to close consumer: {0}")]
    Close(#[source] BrokerError),
}

/// Processing step applied to every received message
pub trait Callback: Send + Sync {
    fn on_message(&self, msg: &Message) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> Callback for F
where
    F: Fn(&Message) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
{
    fn on_message(&self, msg: &Message) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self(msg)
    }
}

/// Callback function type for processing messages
pub type CallbackFunc = Arc<dyn Callback>;

/// Logs every message at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCallback;

impl Callback for LogCallback {
    fn on_message(&self, msg: &Message) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!(
            "Received message in channel {} with key {} - value {}",
            msg.channel,
            msg.key_lossy(),
            msg.value_lossy()
        );
        Ok(())
    }
}

/// What the loop does with a delivery error reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryErrorPolicy {
    /// Every delivery error ends the loop
    #[default]
    Abort,
    /// Transient errors are logged and skipped; fatal ones end the loop
    SkipTransient,
}

impl FromStr for DeliveryErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(DeliveryErrorPolicy::Abort),
            "skip-transient" => Ok(DeliveryErrorPolicy::SkipTransient),
            other => Err(format!(
                "unknown delivery error policy {:?}, expected abort or skip-transient",
                other
            )),
        }
    }
}

impl fmt::Display for DeliveryErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryErrorPolicy::Abort => write!(f, "abort"),
            DeliveryErrorPolicy::SkipTransient => write!(f, "skip-transient"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeStats {
    pub received: u64,
    pub skipped_errors: u64,
}

/// Subscriber drains one channel through a consumer handle
pub struct Subscriber {
    consumer: Box<dyn Consumer>,
    channel: String,
    poll_timeout: Duration,
    policy: DeliveryErrorPolicy,
}

impl Subscriber {
    pub fn new(consumer: Box<dyn Consumer>, config: &SubscriberConfig) -> Self {
        Self {
            consumer,
            channel: config.channel.clone(),
            poll_timeout: config.poll_timeout,
            policy: config.on_delivery_error,
        }
    }

    /// Subscribes and hands each message to `callback` until `token` is cancelled or an
    /// unrecoverable error occurs. A message is acknowledged only after the callback succeeds.
    /// The consumer is closed on every exit path.
    pub async fn run<C>(
        mut self,
        callback: &C,
        token: CancellationToken,
    ) -> Result<SubscribeStats, SubscriberError>
    where
        C: Callback + ?Sized,
    {
        let outcome = self.drain(callback, &token).await;
        let closed = self.consumer.close().await;

        match (outcome, closed) {
            (Ok(stats), Ok(())) => {
                log::info!(
                    "subscriber stopped channel={} received={} skipped_errors={}",
                    self.channel,
                    stats.received,
                    stats.skipped_errors
                );
                Ok(stats)
            }
            (Ok(_), Err(e)) => Err(SubscriberError::Close(e)),
            (Err(e), Err(close_err)) => {
                log::error!("subscriber close after failure also failed: {}", close_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn drain<C>(
        &mut self,
        callback: &C,
        token: &CancellationToken,
    ) -> Result<SubscribeStats, SubscriberError>
    where
        C: Callback + ?Sized,
    {
        let mut stats = SubscribeStats::default();

        self.consumer
            .subscribe(&self.channel)
            .await
            .map_err(SubscriberError::Subscribe)?;
        log::info!(
            "subscriber started channel={} backend={} poll_timeout_ms={} on_delivery_error={}",
            self.channel,
            self.consumer.backend(),
            self.poll_timeout.as_millis(),
            self.policy
        );

        loop {
            let polled = tokio::select! {
                _ = token.cancelled() => break,
                polled = self.consumer.poll(self.poll_timeout) => polled,
            };

            match polled {
                Ok(None) => continue,
                Ok(Some(msg)) => {
                    stats.received += 1;
                    if let Err(source) = callback.on_message(&msg) {
                        log::error!(
                            "Error processing message for channel {}: {}",
                            msg.channel,
                            source
                        );
                        return Err(SubscriberError::Callback {
                            channel: msg.channel,
                            source,
                        });
                    }
                    self.consumer
                        .ack(&msg)
                        .await
                        .map_err(SubscriberError::Ack)?;
                }
                Err(e) if self.policy == DeliveryErrorPolicy::SkipTransient && e.is_transient() => {
                    stats.skipped_errors += 1;
                    log::warn!(
                        "skipping transient delivery error channel={} err={}",
                        self.channel,
                        e
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(TRANSIENT_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    log::error!(
                        "delivery error channel={} transient={} err={}",
                        self.channel,
                        e.is_transient(),
                        e
                    );
                    return Err(SubscriberError::Delivery(e));
                }
            }
        }

        Ok(stats)
    }
}
