use serde::de::DeserializeOwned;
use std::borrow::Cow;

/// Broker-specific token needed to acknowledge a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Receipt {
    /// Message was built locally and never went through a broker
    #[default]
    None,
    Amqp {
        delivery_tag: u64,
    },
    Kafka {
        partition: i32,
        offset: i64,
    },
    Memory {
        offset: usize,
    },
}

/// Message represents one payload addressed to a single channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// Broker timestamp in milliseconds since the epoch, when the broker reports one
    pub timestamp: Option<i64>,
    pub receipt: Receipt,
}

impl Message {
    pub fn new(channel: impl Into<String>, key: Option<Vec<u8>>, value: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            key,
            value,
            timestamp: None,
            receipt: Receipt::None,
        }
    }

    /// Unmarshals the message value into the provided type
    pub fn unmarshal_to<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.value)
    }

    /// Key as text for logging, `-` when the message has no key
    pub fn key_lossy(&self) -> Cow<'_, str> {
        match &self.key {
            Some(key) => String::from_utf8_lossy(key),
            None => Cow::Borrowed("-"),
        }
    }

    pub fn value_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}
