//! Order compensator.
//!
//! Turns order-creation messages into durable orders. A durable write that
//! fails is persisted as an [`OrderFailure`] and retried on an exponential
//! backoff schedule by [`OrderCompensator::spawn`]:
//!
//! ```text
//! pending ──► processing ──► success
//!    ▲             │
//!    └── retry ◄───┤ (retries left)
//!                  └──► failed (budget spent, fast-path deduction released)
//!
//! pending/processing older than the retention window ──► expired
//! ```
//!
//! Replaying a message is harmless: the order store answers a second create
//! for the same (user, product) with [`CreateOrderOutcome::Duplicate`].

use crate::config::CompensationConfig;
use crate::consumer::MessageHandler;
use crate::inventory::InventorySync;
use async_trait::async_trait;
use flashsale_core::environment::{Clock, SystemClock};
use flashsale_core::inventory::SyncStockRequest;
use flashsale_core::message::{Envelope, InboundMessage, OrderCreatedMessage};
use flashsale_core::message_bus::MessageBusError;
use flashsale_core::order::{
    CreateOrderOutcome, CreateOrderRequest, FailureStatus, NewOrderFailure, OrderFailure,
    FAILURE_TYPE_INVENTORY_SYNC, FAILURE_TYPE_ORDER_CREATION,
};
use flashsale_core::purchase::PurchaseStatus;
use flashsale_core::store::{FastStore, OrderStore};
use flashsale_core::StoreError;
use flashsale_runtime::metrics::counter;
use flashsale_runtime::RetryPolicy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Errors from the order compensator.
#[derive(Error, Debug)]
pub enum CompensationError {
    /// A store call failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A message could not be decoded
    #[error("Message error: {0}")]
    Message(#[from] MessageBusError),

    /// A failure record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The order message is malformed and will never succeed
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// No failure record with this id
    #[error("Order failure {0} not found")]
    NotFound(i64),

    /// The failure record already succeeded
    #[error("Order failure {0} already succeeded")]
    AlreadySucceeded(i64),
}

/// Compensator settings.
#[derive(Debug, Clone)]
pub struct CompensatorConfig {
    /// Backoff schedule and retry budget of failure records
    pub retry_policy: RetryPolicy,
    /// Records retried per sweep
    pub batch_size: usize,
    /// Records older than this are expired instead of retried
    pub max_retry_age: chrono::Duration,
    /// Payment window written on new orders
    pub order_timeout: chrono::Duration,
    /// Release the fast-path deduction of abandoned orders
    pub rollback_on_exhaustion: bool,
    /// Time between scheduler sweeps
    pub check_interval: Duration,
}

impl CompensatorConfig {
    /// Extract the compensator settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &CompensationConfig) -> Self {
        Self {
            retry_policy: config.retry_policy(),
            batch_size: config.batch_size,
            max_retry_age: chrono::Duration::hours(config.max_retry_hours),
            order_timeout: chrono::Duration::seconds(config.order_timeout_secs),
            rollback_on_exhaustion: config.rollback_on_exhaustion,
            check_interval: Duration::from_secs(config.check_interval_secs.max(1)),
        }
    }
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        Self::from_config(&CompensationConfig::default())
    }
}

/// What became of an order message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderHandled {
    /// The durable order was written
    Created {
        /// Order id
        order_id: String,
    },
    /// An order for this (user, product) already existed
    AlreadyCreated {
        /// Id of the existing order
        order_id: String,
    },
    /// The write failed and a failure record was scheduled
    Deferred {
        /// Failure record id
        failure_id: i64,
    },
}

/// Compensator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompensatorStats {
    /// Order messages handled
    pub total: u64,
    /// Failure records replayed
    pub processed: u64,
    /// Replays that succeeded
    pub success: u64,
    /// Records abandoned after their last retry
    pub failed: u64,
    /// Replays rescheduled
    pub retried: u64,
    /// Records expired by the retention sweep
    pub expired: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    total: AtomicU64,
    processed: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    expired: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Durable order writer with persisted retries.
pub struct OrderCompensator {
    orders: Arc<dyn OrderStore>,
    fast: Arc<dyn FastStore>,
    inventory: Option<InventorySync>,
    clock: Arc<dyn Clock>,
    config: CompensatorConfig,
    stats: StatsInner,
}

impl std::fmt::Debug for OrderCompensator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderCompensator")
            .field("config", &self.config)
            .field("inventory", &self.inventory)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl OrderCompensator {
    /// Create a compensator writing orders to `orders` and releasing
    /// abandoned deductions in `fast`.
    #[must_use]
    pub fn new(
        orders: Arc<dyn OrderStore>,
        fast: Arc<dyn FastStore>,
        config: CompensatorConfig,
    ) -> Self {
        Self {
            orders,
            fast,
            inventory: None,
            clock: Arc::new(SystemClock),
            config,
            stats: StatsInner::default(),
        }
    }

    /// Settle durable inventory for every created order.
    #[must_use]
    pub fn with_inventory(mut self, inventory: InventorySync) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Use a custom clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create the durable order for a message, or schedule a retry.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError::InvalidOrder`] for a malformed message
    /// (nothing is recorded) and [`CompensationError::Store`] if even the
    /// failure record could not be written.
    pub async fn handle_order_message(
        &self,
        message: &OrderCreatedMessage,
    ) -> Result<OrderHandled, CompensationError> {
        bump(&self.stats.total);
        let request = CreateOrderRequest::from_message(message);
        request.validate().map_err(CompensationError::InvalidOrder)?;

        match self.create(&request).await {
            Ok(outcome) => Ok(self.settle(outcome, message).await),
            Err(StoreError::InvalidInput(reason)) => Err(CompensationError::InvalidOrder(reason)),
            Err(error) => {
                let failure_id = self
                    .defer(message, FAILURE_TYPE_ORDER_CREATION, &error.to_string())
                    .await?;
                Ok(OrderHandled::Deferred { failure_id })
            }
        }
    }

    async fn create(&self, request: &CreateOrderRequest) -> Result<CreateOrderOutcome, StoreError> {
        let expires_at = self.clock.now() + self.config.order_timeout;
        self.orders.create_order(request, expires_at).await
    }

    /// Apply a created order to durable inventory, then mark the purchase
    /// settled. A purchase whose inventory sync was deferred stays pending,
    /// so reconciliation keeps counting its units as in flight.
    async fn settle(&self, outcome: CreateOrderOutcome, message: &OrderCreatedMessage) -> OrderHandled {
        match outcome {
            CreateOrderOutcome::Created(order) => {
                counter!("order_compensation_total", "result" => "created").increment(1);
                info!(order_id = %order.order_id, user_id = order.user_id, product_id = order.product_id, "Order created");
                match self.sync_inventory(message).await {
                    Ok(()) => self.mark(message, PurchaseStatus::Success).await,
                    Err(error) => {
                        if let Err(record_error) = self
                            .defer(message, FAILURE_TYPE_INVENTORY_SYNC, &error.to_string())
                            .await
                        {
                            error!(order_id = %message.order_id, error = %record_error, "Failed to record inventory sync failure");
                            self.mark(message, PurchaseStatus::Success).await;
                        }
                    }
                }
                OrderHandled::Created {
                    order_id: order.order_id,
                }
            }
            CreateOrderOutcome::Duplicate { existing_order_id } => {
                self.mark(message, PurchaseStatus::Success).await;
                counter!("order_compensation_total", "result" => "duplicate").increment(1);
                debug!(order_id = %message.order_id, existing = %existing_order_id, "Order already created");
                OrderHandled::AlreadyCreated {
                    order_id: existing_order_id,
                }
            }
        }
    }

    /// Apply the sale to durable inventory. A refused delta is logged, not
    /// retried: the reconciler picks the drift up.
    async fn sync_inventory(&self, message: &OrderCreatedMessage) -> Result<(), StoreError> {
        let Some(inventory) = &self.inventory else {
            return Ok(());
        };
        let response = inventory
            .sync(&SyncStockRequest {
                product_id: message.product_id,
                delta: -message.quantity,
                order_id: Some(message.order_id.clone()),
                reason: "seckill order".into(),
                trace_id: message.trace_id.clone(),
            })
            .await?;
        if !response.success {
            warn!(
                order_id = %message.order_id,
                product_id = message.product_id,
                stock = response.before_stock,
                "Durable inventory refused the sale"
            );
        }
        Ok(())
    }

    async fn mark(&self, message: &OrderCreatedMessage, status: PurchaseStatus) {
        if let Err(error) = self
            .fast
            .mark_purchase(message.product_id, message.user_id, status)
            .await
        {
            warn!(order_id = %message.order_id, error = %error, "Failed to update pending purchase");
        }
    }

    async fn defer(
        &self,
        message: &OrderCreatedMessage,
        failure_type: &str,
        error_msg: &str,
    ) -> Result<i64, CompensationError> {
        let now = self.clock.now();
        let failure = NewOrderFailure {
            order_id: message.order_id.clone(),
            user_id: message.user_id,
            product_id: message.product_id,
            failure_type: failure_type.to_string(),
            message_data: serde_json::to_string(message)?,
            error_msg: error_msg.to_string(),
            max_retries: self.config.retry_policy.max_retries,
            next_retry_at: self.config.retry_policy.retry_at(0, now),
        };
        let failure_id = self.orders.record_failure(failure).await?;
        counter!("order_failures_recorded_total").increment(1);
        warn!(
            failure_id,
            order_id = %message.order_id,
            failure_type,
            error = error_msg,
            "Order step failed, retry scheduled"
        );
        Ok(failure_id)
    }

    /// Replay one failure record and move it to its next status.
    ///
    /// Returns the status the record ends in.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError::Store`] if the record could not be
    /// updated.
    pub async fn process_failure(
        &self,
        failure: OrderFailure,
    ) -> Result<FailureStatus, CompensationError> {
        bump(&self.stats.processed);
        let now = self.clock.now();
        self.orders
            .set_failure_status(failure.id, FailureStatus::Processing, None, now)
            .await?;

        match self.replay(&failure).await {
            Ok(()) => {
                self.orders
                    .set_failure_status(failure.id, FailureStatus::Success, None, now)
                    .await?;
                bump(&self.stats.success);
                counter!("order_compensation_total", "result" => "retry_success").increment(1);
                info!(failure_id = failure.id, order_id = %failure.order_id, retry_count = failure.retry_count, "Compensation succeeded");
                Ok(FailureStatus::Success)
            }
            Err(reason) => {
                let retry_count = failure.retry_count + 1;
                if retry_count >= failure.max_retries {
                    self.orders
                        .schedule_retry(failure.id, retry_count, &reason, now, now)
                        .await?;
                    self.orders
                        .set_failure_status(failure.id, FailureStatus::Failed, Some(&reason), now)
                        .await?;
                    bump(&self.stats.failed);
                    counter!("order_compensation_total", "result" => "exhausted").increment(1);
                    error!(failure_id = failure.id, order_id = %failure.order_id, retry_count, error = %reason, "Compensation retries exhausted");
                    self.release(&failure).await;
                    Ok(FailureStatus::Failed)
                } else {
                    let next_retry_at = self.config.retry_policy.retry_at(retry_count, now);
                    self.orders
                        .schedule_retry(failure.id, retry_count, &reason, next_retry_at, now)
                        .await?;
                    bump(&self.stats.retried);
                    counter!("order_compensation_total", "result" => "retry_scheduled").increment(1);
                    warn!(failure_id = failure.id, order_id = %failure.order_id, retry_count, next_retry_at = %next_retry_at, error = %reason, "Compensation failed, retry scheduled");
                    Ok(FailureStatus::Pending)
                }
            }
        }
    }

    async fn replay(&self, failure: &OrderFailure) -> Result<(), String> {
        let message: OrderCreatedMessage =
            serde_json::from_str(&failure.message_data).map_err(|e| e.to_string())?;
        match failure.failure_type.as_str() {
            FAILURE_TYPE_ORDER_CREATION => {
                let outcome = self
                    .create(&CreateOrderRequest::from_message(&message))
                    .await
                    .map_err(|e| e.to_string())?;
                self.settle(outcome, &message).await;
                Ok(())
            }
            FAILURE_TYPE_INVENTORY_SYNC => {
                self.sync_inventory(&message).await.map_err(|e| e.to_string())?;
                self.mark(&message, PurchaseStatus::Success).await;
                Ok(())
            }
            other => Err(format!("unknown failure type '{other}'")),
        }
    }

    /// Close out the purchase of a record that will not be retried.
    ///
    /// An abandoned order gives its stock back to the fast path. An abandoned
    /// inventory sync marks the purchase settled and leaves the durable drift
    /// to reconciliation.
    async fn release(&self, failure: &OrderFailure) {
        let message: OrderCreatedMessage = match serde_json::from_str(&failure.message_data) {
            Ok(message) => message,
            Err(error) => {
                error!(failure_id = failure.id, error = %error, "Cannot release purchase, message unreadable");
                return;
            }
        };
        if failure.failure_type == FAILURE_TYPE_INVENTORY_SYNC {
            self.mark(&message, PurchaseStatus::Success).await;
            return;
        }
        if !self.config.rollback_on_exhaustion || failure.failure_type != FAILURE_TYPE_ORDER_CREATION {
            return;
        }
        match self
            .fast
            .rollback(message.product_id, message.user_id, message.quantity)
            .await
        {
            Ok(Some(stock)) => {
                info!(order_id = %message.order_id, product_id = message.product_id, stock, "Fast-path deduction released");
            }
            Ok(None) => {
                debug!(order_id = %message.order_id, "Nothing to release");
            }
            Err(error) => {
                error!(order_id = %message.order_id, error = %error, "Failed to release fast-path deduction");
                return;
            }
        }
        self.mark(&message, PurchaseStatus::Failed).await;
    }

    /// Replay every due failure record, oldest retry time first.
    ///
    /// Returns the number of records processed. A record that cannot be
    /// updated is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError::Store`] if the due records could not be
    /// loaded.
    pub async fn run_due_retries(&self) -> Result<usize, CompensationError> {
        let now = self.clock.now();
        let due = self
            .orders
            .due_failures(now, now - self.config.max_retry_age, self.config.batch_size)
            .await?;
        let count = due.len();
        for failure in due {
            let id = failure.id;
            if let Err(error) = self.process_failure(failure).await {
                error!(failure_id = id, error = %error, "Failed to process order failure");
            }
        }
        if count > 0 {
            debug!(count, "Compensation sweep finished");
        }
        Ok(count)
    }

    /// Expire pending and processing records older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError::Store`] if the sweep failed.
    pub async fn expire_stale(&self) -> Result<usize, CompensationError> {
        let now = self.clock.now();
        let expired = self
            .orders
            .expire_failures(now - self.config.max_retry_age, now)
            .await?;
        for failure in &expired {
            bump(&self.stats.expired);
            counter!("order_compensation_total", "result" => "expired").increment(1);
            warn!(failure_id = failure.id, order_id = %failure.order_id, "Order failure expired");
            self.release(failure).await;
        }
        Ok(expired.len())
    }

    /// One scheduler tick: retries, then expiry.
    pub async fn run_cycle(&self) {
        if let Err(error) = self.run_due_retries().await {
            error!(error = %error, "Compensation retry sweep failed");
        }
        if let Err(error) = self.expire_stale().await {
            error!(error = %error, "Compensation expiry sweep failed");
        }
    }

    /// Replay one failure record now, outside the schedule.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError::NotFound`] for an unknown id and
    /// [`CompensationError::AlreadySucceeded`] for a record that succeeded.
    pub async fn manual_retry(&self, failure_id: i64) -> Result<FailureStatus, CompensationError> {
        let failure = self
            .orders
            .get_failure(failure_id)
            .await?
            .ok_or(CompensationError::NotFound(failure_id))?;
        if failure.status == FailureStatus::Success {
            return Err(CompensationError::AlreadySucceeded(failure_id));
        }
        info!(failure_id, status = failure.status.as_str(), "Manual compensation retry");
        self.process_failure(failure).await
    }

    /// Failure records, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError::Store`] if the query failed.
    pub async fn list_failures(
        &self,
        status: Option<FailureStatus>,
        limit: usize,
    ) -> Result<Vec<OrderFailure>, CompensationError> {
        Ok(self.orders.list_failures(status, limit).await?)
    }

    /// Counters since start.
    #[must_use]
    pub fn stats(&self) -> CompensatorStats {
        CompensatorStats {
            total: self.stats.total.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            success: self.stats.success.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
        }
    }

    /// Run [`OrderCompensator::run_cycle`] every check interval until
    /// shutdown.
    #[must_use]
    pub fn spawn(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.check_interval, "Compensation scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => self.run_cycle().await,
                }
            }
            info!("Compensation scheduler stopped");
        })
    }
}

#[async_trait]
impl MessageHandler for OrderCompensator {
    async fn handle(&self, envelope: &Envelope) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match envelope.decode()? {
            InboundMessage::Order(message) => {
                self.handle_order_message(&message).await?;
            }
            InboundMessage::StockUpdate(update) => {
                debug!(
                    product_id = update.product_id,
                    remaining_stock = update.remaining_stock,
                    trace_id = %update.trace_id,
                    "Stock update received"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use flashsale_core::activity::{Activity, ActivityStatus};
    use flashsale_core::purchase::PurchaseRequest;
    use flashsale_core::store::InventoryStore;
    use flashsale_testing::{
        test_epoch, InMemoryFastStore, InMemoryInventoryStore, InMemoryOrderStore, ManualClock,
    };

    struct Fixture {
        clock: ManualClock,
        orders: Arc<InMemoryOrderStore>,
        fast: Arc<InMemoryFastStore>,
        inventory: Arc<InMemoryInventoryStore>,
        compensator: OrderCompensator,
    }

    async fn fixture(config: CompensatorConfig) -> Fixture {
        let clock = ManualClock::new(test_epoch());
        let orders = Arc::new(InMemoryOrderStore::with_clock(Arc::new(clock.clone())));
        let fast = Arc::new(InMemoryFastStore::new());
        let inventory = Arc::new(InMemoryInventoryStore::with_clock(Arc::new(clock.clone())));
        inventory.init_inventory(7, "phone", 10, 2).await.unwrap();
        fast.preload_activity(
            &Activity {
                product_id: 7,
                product_name: "phone".into(),
                price: 10.0,
                stock: 10,
                start_time: test_epoch() - ChronoDuration::hours(1),
                end_time: test_epoch() + ChronoDuration::days(3),
                status: ActivityStatus::Active,
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let compensator = OrderCompensator::new(orders.clone(), fast.clone(), config)
            .with_inventory(InventorySync::new(inventory.clone(), 0))
            .with_clock(Arc::new(clock.clone()));
        Fixture {
            clock,
            orders,
            fast,
            inventory,
            compensator,
        }
    }

    /// Buy on the fast path and build the matching order message.
    async fn buy(fixture: &Fixture, user_id: i64) -> OrderCreatedMessage {
        let outcome = fixture
            .fast
            .purchase(&PurchaseRequest::new(7, user_id, 1), fixture.clock.now())
            .await
            .unwrap();
        assert!(outcome.is_success());
        OrderCreatedMessage::new(
            format!("SK7{user_id}1"),
            7,
            user_id,
            1,
            10.0,
            fixture.clock.now(),
            "trace_1".into(),
        )
    }

    fn config(max_attempts: u32) -> CompensatorConfig {
        CompensatorConfig::from_config(&CompensationConfig {
            max_attempts,
            ..CompensationConfig::default()
        })
    }

    #[tokio::test]
    async fn test_order_is_created_once_and_settled() {
        let f = fixture(config(5)).await;
        let message = buy(&f, 42).await;

        let first = f.compensator.handle_order_message(&message).await.unwrap();
        assert_eq!(first, OrderHandled::Created { order_id: "SK7421".into() });

        for _ in 0..3 {
            let replay = f.compensator.handle_order_message(&message).await.unwrap();
            assert_eq!(replay, OrderHandled::AlreadyCreated { order_id: "SK7421".into() });
        }

        assert_eq!(f.orders.order_count(), 1);
        assert_eq!(f.orders.idempotency_count(), 1);
        assert_eq!(f.inventory.get_inventory(7).await.unwrap().unwrap().stock, 9);
        let pending = f.fast.pending_purchase(7, 42).await.unwrap().unwrap();
        assert_eq!(pending.status, PurchaseStatus::Success);
        assert_eq!(f.compensator.stats().total, 4);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_on_schedule() {
        let f = fixture(config(5)).await;
        let message = buy(&f, 42).await;
        f.orders.fail_next_creates(1);

        let handled = f.compensator.handle_order_message(&message).await.unwrap();
        assert_eq!(handled, OrderHandled::Deferred { failure_id: 1 });
        let failure_id = 1;
        let failure = f.orders.get_failure(failure_id).await.unwrap().unwrap();
        assert_eq!(failure.status, FailureStatus::Pending);
        assert_eq!(failure.retry_count, 0);
        assert_eq!(failure.next_retry_at, Some(test_epoch() + ChronoDuration::seconds(1)));

        assert_eq!(f.compensator.run_due_retries().await.unwrap(), 0);

        f.clock.advance(ChronoDuration::seconds(1));
        assert_eq!(f.compensator.run_due_retries().await.unwrap(), 1);

        let failure = f.orders.get_failure(failure_id).await.unwrap().unwrap();
        assert_eq!(failure.status, FailureStatus::Success);
        assert_eq!(f.orders.order_count(), 1);
        assert_eq!(f.compensator.stats().success, 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_between_attempts() {
        let f = fixture(config(5)).await;
        let message = buy(&f, 42).await;
        f.orders.fail_next_creates(2);

        f.compensator.handle_order_message(&message).await.unwrap();
        f.clock.advance(ChronoDuration::seconds(1));
        f.compensator.run_due_retries().await.unwrap();

        let failure = f.orders.get_failure(1).await.unwrap().unwrap();
        assert_eq!(failure.status, FailureStatus::Pending);
        assert_eq!(failure.retry_count, 1);
        assert_eq!(
            failure.next_retry_at,
            Some(f.clock.now() + ChronoDuration::seconds(2))
        );
        assert_eq!(f.compensator.stats().retried, 1);
    }

    #[tokio::test]
    async fn test_exhausted_record_releases_the_deduction() {
        let f = fixture(config(2)).await;
        let message = buy(&f, 42).await;
        assert_eq!(f.fast.stock(7).await.unwrap(), Some(9));
        f.orders.fail_next_creates(10);

        f.compensator.handle_order_message(&message).await.unwrap();
        for _ in 0..2 {
            f.clock.advance(ChronoDuration::minutes(10));
            f.compensator.run_due_retries().await.unwrap();
        }

        let failure = f.orders.get_failure(1).await.unwrap().unwrap();
        assert_eq!(failure.status, FailureStatus::Failed);
        assert_eq!(failure.retry_count, 2);
        assert_eq!(f.fast.stock(7).await.unwrap(), Some(10));
        assert!(f.fast.buyers(7).is_empty());
        assert_eq!(f.compensator.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_stale_records_expire_and_release() {
        let f = fixture(config(5)).await;
        let message = buy(&f, 42).await;
        f.orders.fail_next_creates(1);
        f.compensator.handle_order_message(&message).await.unwrap();

        f.clock.advance(ChronoDuration::hours(25));
        assert_eq!(f.compensator.run_due_retries().await.unwrap(), 0);
        assert_eq!(f.compensator.expire_stale().await.unwrap(), 1);

        let failure = f.orders.get_failure(1).await.unwrap().unwrap();
        assert_eq!(failure.status, FailureStatus::Expired);
        assert_eq!(f.fast.stock(7).await.unwrap(), Some(10));
        assert_eq!(f.compensator.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_manual_retry() {
        let f = fixture(config(5)).await;
        let message = buy(&f, 42).await;
        f.orders.fail_next_creates(1);
        f.compensator.handle_order_message(&message).await.unwrap();

        assert!(matches!(
            f.compensator.manual_retry(99).await,
            Err(CompensationError::NotFound(99))
        ));
        assert_eq!(
            f.compensator.manual_retry(1).await.unwrap(),
            FailureStatus::Success
        );
        assert!(matches!(
            f.compensator.manual_retry(1).await,
            Err(CompensationError::AlreadySucceeded(1))
        ));

        let listed = f
            .compensator
            .list_failures(Some(FailureStatus::Success), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_is_not_recorded() {
        let f = fixture(config(5)).await;
        let mut message = buy(&f, 42).await;
        message.quantity = 0;

        let result = f.compensator.handle_order_message(&message).await;

        assert!(matches!(result, Err(CompensationError::InvalidOrder(_))));
        assert!(f.compensator.list_failures(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inventory_sync_failure_gets_its_own_record() {
        let f = fixture(config(5)).await;
        let message = buy(&f, 42).await;
        f.inventory.inject_conflicts(1);

        let handled = f.compensator.handle_order_message(&message).await.unwrap();
        assert!(matches!(handled, OrderHandled::Created { .. }));

        let failure = f.orders.get_failure(1).await.unwrap().unwrap();
        assert_eq!(failure.failure_type, FAILURE_TYPE_INVENTORY_SYNC);
        assert_eq!(f.inventory.get_inventory(7).await.unwrap().unwrap().stock, 10);
        // Still in flight until durable stock reflects the sale
        let pending = f.fast.pending_purchase(7, 42).await.unwrap().unwrap();
        assert_eq!(pending.status, PurchaseStatus::Pending);
        assert_eq!(f.fast.stock_snapshot(7).await.unwrap().unwrap().unsettled, 1);

        f.clock.advance(ChronoDuration::seconds(1));
        f.compensator.run_due_retries().await.unwrap();
        assert_eq!(f.inventory.get_inventory(7).await.unwrap().unwrap().stock, 9);
        assert_eq!(f.orders.order_count(), 1);
        let settled = f.fast.pending_purchase(7, 42).await.unwrap().unwrap();
        assert_eq!(settled.status, PurchaseStatus::Success);
        assert_eq!(f.fast.stock_snapshot(7).await.unwrap().unwrap().unsettled, 0);
    }

    #[tokio::test]
    async fn test_abandoned_inventory_sync_settles_the_purchase() {
        let f = fixture(config(1)).await;
        let message = buy(&f, 42).await;
        f.inventory.inject_conflicts(10);

        f.compensator.handle_order_message(&message).await.unwrap();
        f.clock.advance(ChronoDuration::seconds(1));
        f.compensator.run_due_retries().await.unwrap();

        let failure = f.orders.get_failure(1).await.unwrap().unwrap();
        assert_eq!(failure.status, FailureStatus::Failed);
        let pending = f.fast.pending_purchase(7, 42).await.unwrap().unwrap();
        assert_eq!(pending.status, PurchaseStatus::Success);
        // The order stands, so the deduction is kept
        assert_eq!(f.fast.stock(7).await.unwrap(), Some(9));
        assert_eq!(f.orders.order_count(), 1);
    }

    #[tokio::test]
    async fn test_handler_ignores_stock_updates() {
        let f = fixture(config(5)).await;
        let update = flashsale_core::message::StockUpdateMessage::new(
            7,
            9,
            f.clock.now(),
            "trace_1".into(),
        );

        f.compensator
            .handle(&update.to_envelope().unwrap())
            .await
            .unwrap();

        assert_eq!(f.compensator.stats().total, 0);
    }
}
