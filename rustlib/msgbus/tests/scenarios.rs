use msgbus::{
    connect_consumer, connect_producer, BrokerConfig, BrokerError, DeliveryErrorPolicy,
    DeliveryFault, MemoryBroker, Message, Pacing, Publisher, PublisherConfig, StaticPayload,
    Subscriber, SubscriberConfig, SubscriberError,
};
use serde_json::json;
use std::{
    error::Error,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Registers a broker under a name unique to the calling test
fn broker(name: &str) -> (MemoryBroker, BrokerConfig) {
    init_logging();
    let broker = MemoryBroker::register(name);
    let config = BrokerConfig::new(MemoryBroker::address(name));
    (broker, config)
}

fn subscriber_config(broker: &BrokerConfig) -> SubscriberConfig {
    SubscriberConfig {
        poll_timeout: Duration::from_millis(50),
        ..SubscriberConfig::new(broker.clone())
    }
}

type Received = Arc<Mutex<Vec<Message>>>;

/// Records every message and cancels `token` once `expected` arrived
fn recorder(
    expected: usize,
    token: CancellationToken,
) -> (
    Received,
    impl Fn(&Message) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync,
) {
    let received: Received = Arc::default();
    let sink = received.clone();
    let callback = move |msg: &Message| -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut sink = sink.lock().unwrap();
        sink.push(msg.clone());
        if sink.len() >= expected {
            token.cancel();
        }
        Ok(())
    };
    (received, callback)
}

#[tokio::test]
async fn scenario_three_keyed_messages_are_received_intact() {
    let (_broker, config) = broker("scenario-a");

    let mut producer = connect_producer(&config).await.unwrap();
    for _ in 0..3 {
        producer
            .publish("test", Some(b"test"), br#"{"a":1}"#)
            .await
            .unwrap();
    }
    producer.close().await.unwrap();

    let token = CancellationToken::new();
    let (received, callback) = recorder(3, token.clone());
    let consumer = connect_consumer(&config, "jmsgroup").await.unwrap();
    let stats = Subscriber::new(consumer, &subscriber_config(&config))
        .run(&callback, token)
        .await
        .unwrap();

    assert_eq!(stats.received, 3);
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 3);
    for msg in received.iter() {
        assert_eq!(msg.channel, "test");
        assert_eq!(msg.key_lossy(), "test");
        assert_eq!(msg.value_lossy(), r#"{"a":1}"#);
        assert_eq!(msg.unmarshal_to::<serde_json::Value>().unwrap(), json!({"a": 1}));
    }
    MemoryBroker::unregister("scenario-a");
}

#[tokio::test]
async fn scenario_unreachable_broker_fails_before_polling() {
    init_logging();
    let config = BrokerConfig::new("memory://scenario-b-never-registered");

    let err = connect_consumer(&config, "jmsgroup").await.err().unwrap();
    assert!(matches!(err, BrokerError::ConnectionFailed { .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn scenario_delivery_error_ends_loop_and_releases_handle() {
    let (broker, config) = broker("scenario-c");
    broker.inject_delivery_error("test", DeliveryFault::fatal("topic authorization failed"));

    let consumer = connect_consumer(&config, "jmsgroup").await.unwrap();
    assert_eq!(broker.open_handles(), 1);

    let err = Subscriber::new(consumer, &subscriber_config(&config))
        .run(&msgbus::LogCallback, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SubscriberError::Delivery(_)));
    assert_eq!(broker.open_handles(), 0);
    MemoryBroker::unregister("scenario-c");
}

#[tokio::test]
async fn publisher_feeds_subscriber_end_to_end() {
    let (broker, config) = broker("end-to-end");

    let publisher_config = PublisherConfig {
        messages_per_second: 200.0,
        pacing: Pacing::Compensated,
        max_messages: Some(5),
        ..PublisherConfig::new(config.clone())
    };
    let source = StaticPayload::new(&json!({"a": 1})).unwrap();
    let producer = connect_producer(&config).await.unwrap();
    let publish = tokio::spawn(
        Publisher::new(
            producer,
            Box::new(source),
            &publisher_config,
            publisher_config.pacer().unwrap(),
        )
        .run(CancellationToken::new()),
    );

    let token = CancellationToken::new();
    let (received, callback) = recorder(5, token.clone());
    let consumer = connect_consumer(&config, "jmsgroup").await.unwrap();
    let stats = Subscriber::new(consumer, &subscriber_config(&config))
        .run(&callback, token)
        .await
        .unwrap();

    let published = publish.await.unwrap().unwrap();
    assert_eq!(published.sent, 5);
    assert_eq!(stats.received, 5);
    assert!(received
        .lock()
        .unwrap()
        .iter()
        .all(|m| m.value == br#"{"a":1}"#));
    assert_eq!(broker.open_handles(), 0);
    MemoryBroker::unregister("end-to-end");
}

#[tokio::test]
async fn distinct_groups_each_see_every_message() {
    let (_broker, config) = broker("fan-out");

    let mut producer = connect_producer(&config).await.unwrap();
    for i in 0..4u8 {
        producer.publish("test", None, &[b'0' + i]).await.unwrap();
    }
    producer.close().await.unwrap();

    for group in ["billing", "audit"] {
        let token = CancellationToken::new();
        let (received, callback) = recorder(4, token.clone());
        let consumer = connect_consumer(&config, group).await.unwrap();
        Subscriber::new(consumer, &subscriber_config(&config))
            .run(&callback, token)
            .await
            .unwrap();
        let values: Vec<_> = received
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.value.clone())
            .collect();
        assert_eq!(values, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }
    MemoryBroker::unregister("fan-out");
}

#[tokio::test(start_paused = true)]
async fn transient_errors_can_be_skipped_by_policy() {
    let (broker, config) = broker("skip-transient");
    broker.inject_delivery_error("test", DeliveryFault::transient("broker transport failure"));
    let mut producer = connect_producer(&config).await.unwrap();
    producer.publish("test", Some(b"test"), b"{}").await.unwrap();
    producer.close().await.unwrap();

    let token = CancellationToken::new();
    let (received, callback) = recorder(1, token.clone());
    let consumer = connect_consumer(&config, "jmsgroup").await.unwrap();
    let stats = Subscriber::new(
        consumer,
        &SubscriberConfig {
            on_delivery_error: DeliveryErrorPolicy::SkipTransient,
            ..subscriber_config(&config)
        },
    )
    .run(&callback, token)
    .await
    .unwrap();

    assert_eq!(stats.skipped_errors, 1);
    assert_eq!(received.lock().unwrap().len(), 1);
    MemoryBroker::unregister("skip-transient");
}
