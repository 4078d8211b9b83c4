//! Message channel abstraction.
//!
//! The coordinator publishes order-creation and stock-update messages after a
//! successful fast-path purchase; the order compensator subscribes to them.
//! Delivery is at-least-once and ordered only within a partition (product),
//! so subscribers must tolerate duplicates.
//!
//! # Implementations
//!
//! - `InMemoryMessageBus` in `flashsale-testing`
//! - `RedpandaMessageBus` in `flashsale-redpanda`
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! bus.publish("seckill-orders", &message.to_envelope()?).await?;
//!
//! let mut stream = bus.subscribe(&["seckill-orders", "seckill-stock"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(envelope) => handle(envelope.decode()?).await,
//!         Err(e) => tracing::error!(error = %e, "message stream error"),
//!     }
//! }
//! ```

use crate::message::Envelope;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during message bus operations.
#[derive(Error, Debug, Clone)]
pub enum MessageBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to decode a received message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Anything else
    #[error("Message bus error: {0}")]
    Other(String),
}

/// Stream of envelopes from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Envelope, MessageBusError>> + Send>>;

/// Publish/subscribe transport with at-least-once delivery.
///
/// Implementations must be `Send + Sync`: the coordinator publishes from many
/// request tasks at once.
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to a topic.
    ///
    /// Returns once the broker acknowledged the message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::PublishFailed`] if the broker refused or
    /// timed out.
    fn publish(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessageBusError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::SubscriptionFailed`] if the subscription
    /// cannot be established.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, MessageBusError>> + Send + '_>>;
}
