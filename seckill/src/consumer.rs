//! Message bus consumer with automatic reconnection.
//!
//! [`MessageConsumer`] owns the subscribe-process-reconnect loop; a
//! [`MessageHandler`] supplies what happens to each envelope.
//!
//! ```text
//! loop {
//!     subscribe
//!     for each envelope: handler.handle (errors are logged, processing continues)
//!     stream ended or subscribe failed: wait retry_delay, resubscribe
//! }
//! ```
//!
//! The loop exits when the shutdown broadcast fires.

use async_trait::async_trait;
use flashsale_core::message::Envelope;
use flashsale_core::message_bus::{MessageBus, MessageBusError};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Processes envelopes delivered to a [`MessageConsumer`].
///
/// Errors are logged by the consumer and never stop it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope could not be processed.
    async fn handle(&self, envelope: &Envelope) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Subscribe-process-reconnect loop over a [`MessageBus`].
pub struct MessageConsumer {
    /// Consumer name (for logging)
    name: String,

    /// Topics to subscribe to
    topics: Vec<String>,

    /// Bus to consume from
    bus: Arc<dyn MessageBus>,

    /// Handler for each envelope
    handler: Arc<dyn MessageHandler>,

    /// Shutdown signal receiver
    shutdown: broadcast::Receiver<()>,

    /// Delay before resubscribing (default: 5 seconds)
    retry_delay: Duration,
}

impl MessageConsumer {
    /// Create a consumer with a 5 second reconnect delay.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        topics: Vec<String>,
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn MessageHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            topics,
            bus,
            handler,
            shutdown,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Set a custom reconnect delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn the loop as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, "Message consumer started");

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Message consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.bus.subscribe(&topics) => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, topics = ?self.topics, "Subscribed to message bus");
                            if self.process_stream(&mut stream).await {
                                break;
                            }
                            warn!(consumer = %self.name, "Message stream ended, reconnecting in {:?}", self.retry_delay);
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to message bus, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(consumer = %self.name, "Message consumer stopped");
    }

    /// Drain the stream. Returns `true` if shutdown was requested.
    async fn process_stream<S>(&mut self, stream: &mut S) -> bool
    where
        S: Stream<Item = Result<Envelope, MessageBusError>> + Unpin + Send,
    {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Message consumer received shutdown signal during processing");
                    return true;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(envelope)) => {
                            if let Err(e) = self.handler.handle(&envelope).await {
                                error!(
                                    consumer = %self.name,
                                    message_type = %envelope.message_type,
                                    key = %envelope.key,
                                    error = %e,
                                    "Failed to handle message"
                                );
                            }
                        }
                        Some(Err(e)) => {
                            error!(consumer = %self.name, error = %e, "Error receiving message from stream");
                        }
                        None => return false,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flashsale_core::message::StockUpdateMessage;
    use flashsale_testing::InMemoryMessageBus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(
            &self,
            envelope: &Envelope,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.keys.lock().unwrap().push(envelope.key.clone());
            if envelope.key == "2" {
                return Err("rejected".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_the_consumer() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let handler = Arc::new(Recording::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = MessageConsumer::new(
            "test",
            vec!["seckill-stock".to_string()],
            bus.clone(),
            handler.clone(),
            shutdown_rx,
        )
        .with_retry_delay(Duration::from_millis(10))
        .spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for product_id in 1..=3 {
            let update = StockUpdateMessage::new(product_id, 5, Utc::now(), "trace".into());
            bus.publish("seckill-stock", &update.to_envelope().unwrap())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer did not stop")
            .unwrap();

        assert_eq!(*handler.keys.lock().unwrap(), vec!["1", "2", "3"]);
    }
}
