pub mod amqp;
pub mod broker;
pub mod config;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod message;
pub mod pacing;
pub mod payload;
pub mod publisher;
pub mod signal;
pub mod subscriber;

pub use broker::{
    connect_consumer, connect_producer, BrokerError, BrokerKind, Consumer, ErrorKind, Producer,
};
pub use config::{BrokerConfig, ConfigError, PublisherConfig, SubscriberConfig};
pub use memory::{DeliveryFault, MemoryBroker};
pub use message::{Message, Receipt};
pub use pacing::{Pacer, Pacing};
pub use payload::{PayloadError, PayloadMode, PayloadSource, SequencedPayload, StaticPayload};
pub use publisher::{PublishStats, Publisher, PublisherError};
pub use subscriber::{
    Callback, CallbackFunc, DeliveryErrorPolicy, LogCallback, SubscribeStats, Subscriber,
    SubscriberError,
};
