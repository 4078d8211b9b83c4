//! In-memory [`MessageBus`].
//!
//! Every publish is recorded for assertions and fanned out to the live
//! subscriptions whose topic list contains the topic. Subscriptions only see
//! messages published after they were opened.

use flashsale_core::message::Envelope;
use flashsale_core::message_bus::{MessageBus, MessageBusError, MessageStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type Subscriber = (Vec<String>, mpsc::UnboundedSender<Envelope>);

/// In-memory publish/subscribe bus for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageBus {
    published: Arc<Mutex<Vec<(String, Envelope)>>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything published so far, in order, with its topic.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Envelopes published to `topic`, in order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<Envelope> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessageBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MessageBusError::PublishFailed {
                    topic,
                    reason: "injected publish failure".into(),
                });
            }

            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topic.clone(), envelope.clone()));

            let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subscribers.retain(|(topics, sender)| {
                if topics.iter().any(|t| *t == topic) {
                    sender.send(envelope.clone()).is_ok()
                } else {
                    !sender.is_closed()
                }
            });
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, MessageBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(async move {
            if topics.is_empty() {
                return Err(MessageBusError::SubscriptionFailed {
                    topics,
                    reason: "no topics given".into(),
                });
            }

            let (sender, mut receiver) = mpsc::unbounded_channel();
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topics, sender));

            let stream: MessageStream = Box::pin(async_stream::stream! {
                while let Some(envelope) = receiver.recv().await {
                    yield Ok(envelope);
                }
            });
            Ok(stream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flashsale_core::message::{InboundMessage, OrderCreatedMessage, StockUpdateMessage};
    use futures::StreamExt;

    fn order_envelope() -> Envelope {
        OrderCreatedMessage::new("SK1".into(), 1001, 7, 1, 1999.0, Utc::now(), "trace_1".into())
            .to_envelope()
            .unwrap()
    }

    #[tokio::test]
    async fn test_subscribers_receive_only_their_topics() {
        let bus = InMemoryMessageBus::new();
        let mut orders = bus.subscribe(&["seckill-orders"]).await.unwrap();

        let stock = StockUpdateMessage::new(1001, 9, Utc::now(), "trace_1".into())
            .to_envelope()
            .unwrap();
        bus.publish("seckill-stock", &stock).await.unwrap();
        bus.publish("seckill-orders", &order_envelope()).await.unwrap();

        let received = orders.next().await.unwrap().unwrap();
        assert!(matches!(received.decode().unwrap(), InboundMessage::Order(_)));
        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.published_to("seckill-stock").len(), 1);
    }

    #[tokio::test]
    async fn test_failing_bus_records_nothing() {
        let bus = InMemoryMessageBus::new();
        bus.set_failing(true);

        let result = bus.publish("seckill-orders", &order_envelope()).await;

        assert!(matches!(result, Err(MessageBusError::PublishFailed { .. })));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_empty_subscription_is_refused() {
        let bus = InMemoryMessageBus::new();
        assert!(bus.subscribe(&[]).await.is_err());
    }
}
