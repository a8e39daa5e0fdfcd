use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use crate::pacing::{Pacer, Pacing};
use crate::payload::PayloadMode;
use crate::subscriber::DeliveryErrorPolicy;

pub const DEFAULT_CHANNEL: &str = "test";
pub const DEFAULT_BROKER_ADDRESS: &str = "kafka:9092";
pub const DEFAULT_MESSAGES_PER_SECOND: f64 = 5.0;
pub const DEFAULT_MESSAGE_KEY: &str = "test";
pub const DEFAULT_PAYLOAD_PATH: &str = "opt/data.json";
pub const DEFAULT_GROUP_ID: &str = "jmsgroup";
pub const DEFAULT_AMQP_EXCHANGE: &str = "msgbus";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Connection settings shared by both roles
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub address: String,
    pub connect_timeout: Duration,
    /// Extra connection attempts after the first failure; 0 fails fast
    pub connect_retries: u32,
    /// Direct exchange used when the address is an AMQP URL
    pub amqp_exchange: String,
}

impl BrokerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retries: 0,
            amqp_exchange: DEFAULT_AMQP_EXCHANGE.to_string(),
        }
    }

    fn from_lookup(lookup: Lookup) -> Result<Self, ConfigError> {
        Ok(Self {
            address: first_of(
                lookup,
                &["BROKER_ADDRESS", "KAFKA_URL"],
                DEFAULT_BROKER_ADDRESS,
            ),
            connect_timeout: duration(lookup, "CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT)?,
            connect_retries: parsed(lookup, "CONNECT_RETRIES", 0)?,
            amqp_exchange: first_of(lookup, &["AMQP_EXCHANGE"], DEFAULT_AMQP_EXCHANGE),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(invalid("BROKER_ADDRESS", "cannot be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("CONNECT_TIMEOUT", "must be greater than zero"));
        }
        if self.amqp_exchange.is_empty() {
            return Err(invalid("AMQP_EXCHANGE", "cannot be empty"));
        }
        Ok(())
    }

    /// Address safe for logs: the password of an AMQP URL is replaced with `***`
    pub fn masked_address(&self) -> String {
        let Some((scheme, rest)) = self.address.split_once("://") else {
            return self.address.clone();
        };
        let Some((userinfo, host)) = rest.rsplit_once('@') else {
            return self.address.clone();
        };
        match userinfo.split_once(':') {
            Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
            None => self.address.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub broker: BrokerConfig,
    pub channel: String,
    pub key: String,
    pub messages_per_second: f64,
    pub pacing: Pacing,
    pub payload_path: PathBuf,
    pub payload_mode: PayloadMode,
    /// Stop after this many send attempts; `None` runs until cancelled
    pub max_messages: Option<u64>,
    /// Upper bound on waiting for one message's delivery report
    pub send_timeout: Duration,
}

impl PublisherConfig {
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            channel: DEFAULT_CHANNEL.to_string(),
            key: DEFAULT_MESSAGE_KEY.to_string(),
            messages_per_second: DEFAULT_MESSAGES_PER_SECOND,
            pacing: Pacing::default(),
            payload_path: PathBuf::from(DEFAULT_PAYLOAD_PATH),
            payload_mode: PayloadMode::default(),
            max_messages: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup) -> Result<Self, ConfigError> {
        let config = Self {
            broker: BrokerConfig::from_lookup(lookup)?,
            channel: first_of(lookup, &["CHANNEL_NAME", "KAFKA_TOPIC"], DEFAULT_CHANNEL),
            key: first_of(lookup, &["MESSAGE_KEY"], DEFAULT_MESSAGE_KEY),
            messages_per_second: parsed(
                lookup,
                "MESSAGES_PER_SECOND",
                DEFAULT_MESSAGES_PER_SECOND,
            )?,
            pacing: parsed(lookup, "PACING", Pacing::default())?,
            payload_path: PathBuf::from(first_of(lookup, &["PAYLOAD_PATH"], DEFAULT_PAYLOAD_PATH)),
            payload_mode: parsed(lookup, "PAYLOAD_MODE", PayloadMode::default())?,
            max_messages: match var(lookup, "MAX_MESSAGES") {
                Some(raw) => Some(parse_value("MAX_MESSAGES", &raw)?),
                None => None,
            },
            send_timeout: duration(lookup, "SEND_TIMEOUT", DEFAULT_SEND_TIMEOUT)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if self.channel.is_empty() {
            return Err(invalid("CHANNEL_NAME", "cannot be empty"));
        }
        self.pacer()?;
        if self.payload_path.as_os_str().is_empty() {
            return Err(invalid("PAYLOAD_PATH", "cannot be empty"));
        }
        if self.max_messages == Some(0) {
            return Err(invalid("MAX_MESSAGES", "must be greater than zero"));
        }
        if self.send_timeout.is_zero() {
            return Err(invalid("SEND_TIMEOUT", "must be greater than zero"));
        }
        Ok(())
    }

    /// Pacer for the configured rate; fails for rates that do not yield a usable interval
    pub fn pacer(&self) -> Result<Pacer, ConfigError> {
        Pacer::from_rate(self.messages_per_second, self.pacing).ok_or_else(|| {
            invalid(
                "MESSAGES_PER_SECOND",
                &format!(
                    "must be a finite number greater than zero, got {}",
                    self.messages_per_second
                ),
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub broker: BrokerConfig,
    pub channel: String,
    /// Instances sharing a group id split the channel, distinct ids each get every message
    pub group_id: String,
    pub poll_timeout: Duration,
    pub on_delivery_error: DeliveryErrorPolicy,
}

impl SubscriberConfig {
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            channel: DEFAULT_CHANNEL.to_string(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            on_delivery_error: DeliveryErrorPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup) -> Result<Self, ConfigError> {
        let config = Self {
            broker: BrokerConfig::from_lookup(lookup)?,
            channel: first_of(lookup, &["CHANNEL_NAME", "KAFKA_TOPIC"], DEFAULT_CHANNEL),
            group_id: first_of(lookup, &["GROUP_ID"], DEFAULT_GROUP_ID),
            poll_timeout: duration(lookup, "POLL_TIMEOUT", DEFAULT_POLL_TIMEOUT)?,
            on_delivery_error: parsed(
                lookup,
                "ON_DELIVERY_ERROR",
                DeliveryErrorPolicy::default(),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if self.channel.is_empty() {
            return Err(invalid("CHANNEL_NAME", "cannot be empty"));
        }
        if self.group_id.is_empty() {
            return Err(invalid("GROUP_ID", "cannot be empty"));
        }
        if self.poll_timeout.is_zero() {
            return Err(invalid("POLL_TIMEOUT", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidEnvVar(key.to_string(), reason.to_string())
}

fn var(lookup: Lookup, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First non-empty value among `keys`, in order, else the default
fn first_of(lookup: Lookup, keys: &[&str], default: &str) -> String {
    keys.iter()
        .find_map(|key| var(lookup, key))
        .unwrap_or_else(|| default.to_string())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>()
        .map_err(|e| invalid(key, &format!("{:?}: {}", raw, e)))
}

fn parsed<T>(lookup: Lookup, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match var(lookup, key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn duration(lookup: Lookup, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match var(lookup, key) {
        Some(raw) => humantime::parse_duration(&raw)
            .map_err(|e| invalid(key, &format!("{:?}: {}", raw, e))),
        None => Ok(default),
    }
}
