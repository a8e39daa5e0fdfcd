use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, Producer};
use crate::config::PublisherConfig;
use crate::pacing::Pacer;
use crate::payload::{PayloadError, PayloadSource};

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("Failed to build payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("Failed to send message: {0}")]
    Send(#[source] BrokerError),
    #[error("Failed to close producer: {0}")]
    Close(#[source] BrokerError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub sent: u64,
    pub failed: u64,
}

impl PublishStats {
    pub fn attempted(&self) -> u64 {
        self.sent + self.failed
    }
}

/// Rate-paced publish loop over one producer handle
pub struct Publisher {
    producer: Box<dyn Producer>,
    source: Box<dyn PayloadSource>,
    channel: String,
    key: Vec<u8>,
    pacer: Pacer,
    send_timeout: Duration,
    max_messages: Option<u64>,
}

impl Publisher {
    /// Builds the loop from an already connected producer.
    ///
    /// `config` must have passed [`PublisherConfig::validate`].
    pub fn new(
        producer: Box<dyn Producer>,
        source: Box<dyn PayloadSource>,
        config: &PublisherConfig,
        pacer: Pacer,
    ) -> Self {
        Self {
            producer,
            source,
            channel: config.channel.clone(),
            key: config.key.clone().into_bytes(),
            pacer,
            send_timeout: config.send_timeout,
            max_messages: config.max_messages,
        }
    }

    /// Publishes until `token` is cancelled, the message limit is reached, or a fatal send
    /// error occurs. The producer is flushed and closed on every exit path.
    pub async fn run(mut self, token: CancellationToken) -> Result<PublishStats, PublisherError> {
        log::info!(
            "publisher starting channel={} backend={} interval_ms={} pacing={} max_messages={:?}",
            self.channel,
            self.producer.backend(),
            self.pacer.interval().as_millis(),
            self.pacer.policy(),
            self.max_messages
        );

        let outcome = self.pump(&token).await;

        if let Err(e) = self.producer.flush(self.send_timeout).await {
            log::warn!("publisher flush before close failed: {}", e);
        }
        let closed = self.producer.close().await;

        match (outcome, closed) {
            (Ok(stats), Ok(())) => {
                log::info!(
                    "publisher stopped channel={} sent={} failed={}",
                    self.channel,
                    stats.sent,
                    stats.failed
                );
                Ok(stats)
            }
            (Ok(_), Err(e)) => Err(PublisherError::Close(e)),
            (Err(e), Err(close_err)) => {
                log::error!("publisher close after failure also failed: {}", close_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn pump(&mut self, token: &CancellationToken) -> Result<PublishStats, PublisherError> {
        let mut stats = PublishStats::default();

        while !token.is_cancelled() && !self.limit_reached(&stats) {
            let started = Instant::now();
            self.publish_once(&mut stats).await?;
            if self.limit_reached(&stats) {
                break;
            }

            let delay = self.pacer.delay_after(started.elapsed());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        Ok(stats)
    }

    fn limit_reached(&self, stats: &PublishStats) -> bool {
        self.max_messages.is_some_and(|max| stats.attempted() >= max)
    }

    /// Sends one message. Transient send failures are logged and counted; fatal ones are
    /// returned.
    async fn publish_once(&mut self, stats: &mut PublishStats) -> Result<(), PublisherError> {
        let value = self.source.next_value()?;
        let seq = stats.attempted() + 1;
        log::info!(
            "Sending message seq={} channel={} bytes={}",
            seq,
            self.channel,
            value.len()
        );

        let sent = timeout(
            self.send_timeout,
            self.producer.publish(&self.channel, Some(self.key.as_slice()), &value),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BrokerError::PublishFailed {
                channel: self.channel.clone(),
                reason: format!("no delivery report within {:?}", self.send_timeout),
                transient: true,
            })
        });

        match sent {
            Ok(()) => {
                stats.sent += 1;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                stats.failed += 1;
                log::error!(
                    "publish failed seq={} channel={} transient=true err={}",
                    seq,
                    self.channel,
                    e
                );
                Ok(())
            }
            Err(e) => {
                stats.failed += 1;
                log::error!(
                    "publish failed seq={} channel={} transient=false err={}",
                    seq,
                    self.channel,
                    e
                );
                Err(PublisherError::Send(e))
            }
        }
    }
}
