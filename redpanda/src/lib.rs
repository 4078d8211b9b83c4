//! Redpanda message bus for the flash-sale engine.
//!
//! Implements [`MessageBus`] from `flashsale-core` on rdkafka, so any
//! Kafka-compatible broker works (Redpanda, Apache Kafka, MSK).
//!
//! # Wire format
//!
//! - record key: [`Envelope::key`], the product id, so every message about a
//!   product lands on one partition and keeps its order
//! - record payload: [`Envelope::payload`], the JSON body unchanged
//! - header `message-type`: [`Envelope::message_type`]
//!
//! Records from producers that do not set the header are still accepted when
//! the JSON body carries a `message_type` field.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER the envelope reached the subscriber's channel
//! - If the process crashes before commit, messages are redelivered
//! - Subscribers MUST be idempotent (the order store's (user, product)
//!   idempotency row covers order messages)
//!
//! # Example
//!
//! ```no_run
//! use flashsale_redpanda::RedpandaMessageBus;
//! use flashsale_core::message_bus::MessageBus;
//! use flashsale_core::message::StockUpdateMessage;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaMessageBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("seckill-compensator")
//!     .build()?;
//!
//! let update = StockUpdateMessage::new(1001, 99, chrono::Utc::now(), "trace_1".into());
//! bus.publish("seckill-stock", &update.to_envelope()?).await?;
//!
//! let mut stream = bus.subscribe(&["seckill-stock"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(envelope) => println!("Received: {}", envelope.message_type),
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use flashsale_core::message::Envelope;
use flashsale_core::message_bus::{MessageBus, MessageBusError, MessageStream};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Record header carrying the envelope's message type.
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redpanda message bus.
///
/// The producer is created up front and shared by every publish; each
/// subscription creates its own consumer owned by a forwarding task.
///
/// # Example
///
/// ```no_run
/// use flashsale_redpanda::RedpandaMessageBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaMessageBus::new("localhost:9092")?;
///
/// let bus = RedpandaMessageBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaMessageBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaMessageBus {
    /// Create a message bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, MessageBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaMessageBusBuilder {
        RedpandaMessageBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

impl std::fmt::Debug for RedpandaMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaMessageBus")
            .field("brokers", &self.brokers)
            .field("consumer_group", &self.consumer_group)
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RedpandaMessageBus`].
#[derive(Debug, Default)]
pub struct RedpandaMessageBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaMessageBusBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all", an order message must not be lost after the fast path
    /// already deducted stock.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every instance of the subscriber.
    ///
    /// If not set, the group is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Envelopes buffered between the consumer and the subscriber.
    ///
    /// Default: 1000. Zero is treated as one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a new consumer group starts reading: "earliest", "latest" or
    /// "error".
    ///
    /// Default: "earliest", so orders published before the compensator first
    /// started are still created.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaMessageBus`].
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaMessageBus, MessageBusError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| MessageBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                MessageBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaMessageBus created"
        );

        Ok(RedpandaMessageBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

/// Consumer group used when none is configured.
fn default_group(topics: &[String]) -> String {
    let mut sorted = topics.to_vec();
    sorted.sort();
    format!("flashsale-{}", sorted.join("-"))
}

/// Message type carried in the JSON body, for records without the header.
fn message_type_from_body(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get("message_type")?
        .as_str()
        .map(str::to_string)
}

/// Rebuild an envelope from a received record.
fn envelope_from_record(
    key: Option<&[u8]>,
    header_type: Option<&[u8]>,
    payload: Option<&[u8]>,
) -> Result<Envelope, MessageBusError> {
    let payload = payload.ok_or_else(|| {
        MessageBusError::DeserializationFailed("Message has no payload".to_string())
    })?;

    let message_type = header_type
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .map(str::to_string)
        .or_else(|| message_type_from_body(payload))
        .ok_or_else(|| {
            MessageBusError::DeserializationFailed("Message has no message type".to_string())
        })?;

    let key = key
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .unwrap_or_default();

    Ok(Envelope {
        message_type,
        key,
        payload: payload.to_vec(),
    })
}

fn decode_record(message: &BorrowedMessage<'_>) -> Result<Envelope, MessageBusError> {
    let header_type = message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|h| h.key == MESSAGE_TYPE_HEADER)
            .and_then(|h| h.value)
    });
    envelope_from_record(message.key(), header_type, message.payload())
}

impl MessageBus for RedpandaMessageBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessageBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let headers = OwnedHeaders::new().insert(Header {
                key: MESSAGE_TYPE_HEADER,
                value: Some(envelope.message_type.as_bytes()),
            });
            let record = FutureRecord::to(&topic)
                .payload(&envelope.payload)
                .key(envelope.key.as_bytes())
                .headers(headers);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        message_type = %envelope.message_type,
                        key = %envelope.key,
                        "Message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        key = %envelope.key,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(MessageBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, MessageBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            if topics.is_empty() {
                return Err(MessageBusError::SubscriptionFailed {
                    topics,
                    reason: "No topics given".to_string(),
                });
            }

            let group_id = consumer_group.unwrap_or_else(|| default_group(&topics));

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| MessageBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| MessageBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group_id,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(next) = stream.next().await {
                    match next {
                        Ok(message) => {
                            let decoded = decode_record(&message);
                            if let Ok(envelope) = &decoded {
                                tracing::trace!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    message_type = %envelope.message_type,
                                    "Received message"
                                );
                            }

                            // Commit only after the subscriber has the message.
                            if tx.send(decoded).await.is_err() {
                                tracing::debug!("Subscriber dropped, exiting consumer task");
                                break;
                            }

                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        }
                        Err(e) => {
                            let err = MessageBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flashsale_core::message::{ORDER_MESSAGE_TYPE, STOCK_MESSAGE_TYPE};

    #[test]
    fn redpanda_message_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaMessageBus>();
        assert_sync::<RedpandaMessageBus>();
    }

    #[test]
    fn build_requires_brokers() {
        let result = RedpandaMessageBus::builder().build();
        assert!(matches!(result, Err(MessageBusError::ConnectionFailed(_))));

        let result = RedpandaMessageBus::builder().brokers("  ").build();
        assert!(matches!(result, Err(MessageBusError::ConnectionFailed(_))));
    }

    #[test]
    fn default_group_is_order_independent() {
        let a = default_group(&["seckill-stock".into(), "seckill-orders".into()]);
        let b = default_group(&["seckill-orders".into(), "seckill-stock".into()]);
        assert_eq!(a, b);
        assert_eq!(a, "flashsale-seckill-orders-seckill-stock");
    }

    #[test]
    fn header_type_wins_over_body() {
        let body = br#"{"message_type":"stock_update","product_id":1}"#;
        let envelope =
            envelope_from_record(Some(b"1"), Some(ORDER_MESSAGE_TYPE.as_bytes()), Some(body))
                .unwrap();

        assert_eq!(envelope.message_type, ORDER_MESSAGE_TYPE);
        assert_eq!(envelope.key, "1");
        assert_eq!(envelope.payload, body.to_vec());
    }

    #[test]
    fn body_type_used_without_header() {
        let body = br#"{"message_type":"stock_update","product_id":1}"#;
        let envelope = envelope_from_record(None, None, Some(body)).unwrap();

        assert_eq!(envelope.message_type, STOCK_MESSAGE_TYPE);
        assert_eq!(envelope.key, "");
    }

    #[test]
    fn records_without_payload_or_type_are_rejected() {
        assert!(matches!(
            envelope_from_record(Some(b"1"), None, None),
            Err(MessageBusError::DeserializationFailed(_))
        ));
        assert!(matches!(
            envelope_from_record(Some(b"1"), None, Some(b"not json")),
            Err(MessageBusError::DeserializationFailed(_))
        ));
    }
}
