//! Integration tests for [`RedpandaMessageBus`] against a real Kafka broker.
//!
//! Marked `#[ignore]`: they need Docker and take 15-60 seconds each to start
//! the broker.
//!
//! ```bash
//! cargo test -p flashsale-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]

use chrono::Utc;
use flashsale_core::message::{
    Envelope, InboundMessage, OrderCreatedMessage, StockUpdateMessage, ORDER_MESSAGE_TYPE,
};
use flashsale_core::message_bus::MessageBus;
use flashsale_redpanda::RedpandaMessageBus;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const WARMUP_TYPE: &str = "warmup";

fn warmup() -> Envelope {
    Envelope {
        message_type: WARMUP_TYPE.into(),
        key: "warmup".into(),
        payload: b"{}".to_vec(),
    }
}

/// Start Kafka and return the container with its broker address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

/// Publish a warmup message until the topic exists and metadata propagated.
async fn ensure_topic_exists(bus: &RedpandaMessageBus, topic: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if bus.publish(topic, &warmup()).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != max_attempts, "Failed to create topic {topic}");
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_order_and_stock_messages_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaMessageBus::builder()
        .brokers(&brokers)
        .consumer_group("round-trip")
        .build()
        .expect("Failed to create message bus");

    ensure_topic_exists(&bus, "seckill-orders").await;
    ensure_topic_exists(&bus, "seckill-stock").await;

    let mut stream = bus
        .subscribe(&["seckill-orders", "seckill-stock"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let order = OrderCreatedMessage::new(
        "SK1001742".into(),
        1001,
        42,
        1,
        1999.0,
        Utc::now(),
        "trace_1".into(),
    );
    let stock = StockUpdateMessage::new(1001, 9, Utc::now(), "trace_1".into());
    bus.publish("seckill-orders", &order.to_envelope().expect("encode"))
        .await
        .expect("Failed to publish order");
    bus.publish("seckill-stock", &stock.to_envelope().expect("encode"))
        .await
        .expect("Failed to publish stock");

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), async {
        while received.len() < 2 {
            if let Some(result) = stream.next().await {
                let envelope = result.expect("Failed to receive message");
                if envelope.message_type != WARMUP_TYPE {
                    received.push(envelope);
                }
            }
        }
    })
    .await
    .expect("Timeout waiting for messages");

    let decoded: Vec<InboundMessage> = received
        .iter()
        .map(|e| e.decode().expect("decode"))
        .collect();
    assert!(decoded.contains(&InboundMessage::Order(order)));
    assert!(decoded.contains(&InboundMessage::StockUpdate(stock)));
    assert!(received.iter().all(|e| e.key == "1001"));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_messages_for_one_product_keep_order() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaMessageBus::builder()
        .brokers(&brokers)
        .consumer_group("ordering")
        .build()
        .expect("Failed to create message bus");

    ensure_topic_exists(&bus, "seckill-stock").await;
    let mut stream = bus.subscribe(&["seckill-stock"]).await.expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    for remaining in (0..5).rev() {
        let update = StockUpdateMessage::new(2002, remaining, Utc::now(), "trace".into());
        bus.publish("seckill-stock", &update.to_envelope().expect("encode"))
            .await
            .expect("Failed to publish");
    }

    let mut remaining = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), async {
        while remaining.len() < 5 {
            if let Some(result) = stream.next().await {
                let envelope = result.expect("Failed to receive message");
                if let Ok(InboundMessage::StockUpdate(update)) = envelope.decode() {
                    remaining.push(update.remaining_stock);
                }
            }
        }
    })
    .await
    .expect("Timeout waiting for messages");

    assert_eq!(remaining, vec![4, 3, 2, 1, 0]);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_header_carries_message_type() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaMessageBus::builder()
        .brokers(&brokers)
        .consumer_group("headers")
        .build()
        .expect("Failed to create message bus");

    ensure_topic_exists(&bus, "seckill-orders").await;
    let mut stream = bus.subscribe(&["seckill-orders"]).await.expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Body without a message_type field: only the header identifies it.
    let envelope = Envelope {
        message_type: ORDER_MESSAGE_TYPE.into(),
        key: "3003".into(),
        payload: br#"{"order_id":"x"}"#.to_vec(),
    };
    bus.publish("seckill-orders", &envelope).await.expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if let Some(Ok(e)) = stream.next().await {
                if e.key == "3003" {
                    return e;
                }
            }
        }
    })
    .await
    .expect("Timeout waiting for message");

    assert_eq!(received, envelope);
}
