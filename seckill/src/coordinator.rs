//! Seckill coordinator.
//!
//! Admission control in front of the purchase protocol:
//!
//! ```text
//! request ─► validate ─► degraded? ─► limiter ─► breaker ─► FastStore::purchase
//!                                                               │
//!                                 success ─► stock-update + order-creation messages
//! ```
//!
//! [`SeckillCoordinator::process_seckill`] answers on the caller's task.
//! [`SeckillCoordinator::process_seckill_async`] runs the same admission
//! checks, then hands the purchase to the bounded request queue and returns a
//! [`PendingSeckill`] future.
//!
//! The request deadline bounds the purchase step only. The purchase and its
//! settlement run on their own task, so neither a missed deadline nor a
//! dropped caller can separate a deduction from its order message:
//!
//! - the store answers in time: the caller waits for settlement, however long
//!   publishing takes
//! - the deadline passes first: the caller gets
//!   [`SeckillCode::RequestTimeout`] and a deduction that lands afterwards is
//!   rolled back
//!
//! An order message the bus refuses is written to the order-failure store so
//! the compensator creates the order on its retry schedule.
//!
//! Every answer is a [`SeckillResponse`]: business outcomes and overload
//! signals carry distinct codes, infrastructure failures map to
//! [`SeckillCode::SystemError`].

use crate::config::Config;
use flashsale_core::activity::Activity;
use flashsale_core::environment::{Clock, SystemClock};
use flashsale_core::message::{Envelope, OrderCreatedMessage, StockUpdateMessage};
use flashsale_core::message_bus::{MessageBus, MessageBusError};
use flashsale_core::order::{NewOrderFailure, FAILURE_TYPE_ORDER_CREATION};
use flashsale_core::purchase::{
    PendingPurchase, ProductStats, PurchaseOutcome, PurchaseRequest, SeckillCode, SeckillResponse,
};
use flashsale_core::store::{FastStore, InventoryStore, OrderStore};
use flashsale_core::StoreError;
use flashsale_runtime::metrics::{counter, histogram};
use flashsale_runtime::queue::Completion;
use flashsale_runtime::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, Limiter, MultiLevelLimiter,
    QueueConfig, QueueError, QueueStats, RequestQueue, State,
};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Predicate consulted before every purchase; `true` rejects it as busy.
pub type BusyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline of the purchase step, queueing included
    pub request_timeout: Duration,
    /// Lifetime of preloaded activity keys
    pub activity_ttl: Duration,
    /// Start degraded
    pub degradation_enabled: bool,
    /// Message of busy rejections
    pub degradation_message: String,
    /// Price used when a product was not preloaded through this coordinator
    pub default_price: f64,
    /// Order-creation topic
    pub order_topic: String,
    /// Stock-update topic
    pub stock_topic: String,
    /// Minimum stock of inventory records seeded by a preload
    pub low_stock_threshold: i64,
    /// Retry budget of order messages handed to compensation
    pub order_max_retries: u32,
}

impl CoordinatorConfig {
    /// Extract the coordinator settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.seckill.request_timeout(),
            activity_ttl: config.seckill.activity_ttl(),
            degradation_enabled: config.seckill.degradation_enabled,
            degradation_message: config.seckill.degradation_message.clone(),
            default_price: config.seckill.default_price,
            order_topic: config.redpanda.order_topic.clone(),
            stock_topic: config.redpanda.stock_topic.clone(),
            low_stock_threshold: config.reconcile.low_stock_threshold,
            order_max_retries: config.compensation.max_attempts,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Service-level request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Every answered request
    pub total_requests: u64,
    /// Successful purchases
    pub success_requests: u64,
    /// Everything else
    pub failed_requests: u64,
    /// Rejected by the rate limiter
    pub rate_limited_requests: u64,
    /// Rejected by the circuit breaker
    pub circuit_open_requests: u64,
    /// Rejected by a full request queue
    pub queue_full_requests: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    circuit_open: AtomicU64,
    queue_full: AtomicU64,
}

impl Counters {
    fn record(&self, code: Option<SeckillCode>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match code {
            Some(SeckillCode::Success) => {
                self.success.fetch_add(1, Ordering::Relaxed);
            }
            other => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let bucket = match other {
                    Some(SeckillCode::RateLimited) => Some(&self.rate_limited),
                    Some(SeckillCode::CircuitOpen) => Some(&self.circuit_open),
                    Some(SeckillCode::QueueFull) => Some(&self.queue_full),
                    _ => None,
                };
                if let Some(bucket) = bucket {
                    bucket.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            total_requests: self.total.load(Ordering::Relaxed),
            success_requests: self.success.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited.load(Ordering::Relaxed),
            circuit_open_requests: self.circuit_open.load(Ordering::Relaxed),
            queue_full_requests: self.queue_full.load(Ordering::Relaxed),
        }
    }
}

/// Where a purchase stands once the fast store answered.
#[derive(Debug)]
enum Attempt {
    /// Stock deducted, settlement follows
    Purchased,
    /// Final answer, nothing to settle
    Finished(SeckillResponse),
}

/// A queued purchase and the instant its purchase step must answer by.
#[derive(Debug, Clone, Copy)]
struct QueuedPurchase {
    request: PurchaseRequest,
    deadline: tokio::time::Instant,
}

/// State shared between the coordinator, its queue workers and purchase
/// tasks.
struct Shared {
    store: Arc<dyn FastStore>,
    bus: Arc<dyn MessageBus>,
    orders: Option<Arc<dyn OrderStore>>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    counters: Counters,
    prices: RwLock<HashMap<i64, f64>>,
}

impl Shared {
    /// Answer a purchase whose store step must finish by `deadline`.
    async fn execute(
        self: &Arc<Self>,
        request: PurchaseRequest,
        deadline: tokio::time::Instant,
    ) -> SeckillResponse {
        let (reply, mut answer) = oneshot::channel();
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move { shared.purchase_and_settle(request, reply).await });

        let attempt = match tokio::time::timeout_at(deadline, &mut answer).await {
            Ok(Ok(attempt)) => attempt,
            Ok(Err(_)) => {
                error!(
                    product_id = request.product_id,
                    user_id = request.user_id,
                    "Purchase task ended without an answer"
                );
                return SeckillResponse::rejected(SeckillCode::SystemError);
            }
            Err(_) => {
                // Closing first decides the race with a reply sent right at the deadline
                answer.close();
                if let Ok(attempt) = answer.try_recv() {
                    attempt
                } else {
                    warn!(
                        product_id = request.product_id,
                        user_id = request.user_id,
                        "Purchase timed out"
                    );
                    return SeckillResponse::rejected(SeckillCode::RequestTimeout);
                }
            }
        };

        match attempt {
            Attempt::Finished(response) => response,
            Attempt::Purchased => match task.await {
                Ok(Some(response)) => response,
                Ok(None) | Err(_) => {
                    error!(
                        product_id = request.product_id,
                        user_id = request.user_id,
                        "Purchase settlement did not finish"
                    );
                    SeckillResponse::rejected(SeckillCode::SystemError)
                }
            },
        }
    }

    /// Purchase, then settle the deduction unless the caller already gave
    /// up on it. Returns the settled response.
    async fn purchase_and_settle(
        &self,
        request: PurchaseRequest,
        reply: oneshot::Sender<Attempt>,
    ) -> Option<SeckillResponse> {
        let remaining_stock = match self.attempt(request).await {
            Ok(remaining_stock) => remaining_stock,
            Err(response) => {
                let _ = reply.send(Attempt::Finished(response));
                return None;
            }
        };
        if reply.send(Attempt::Purchased).is_err() {
            self.abandon(request).await;
            return None;
        }
        Some(self.settle(request, remaining_stock).await)
    }

    /// Run the purchase step through the breaker. `Ok` carries the remaining
    /// stock of a successful deduction.
    async fn attempt(&self, request: PurchaseRequest) -> Result<i64, SeckillResponse> {
        let now = self.clock.now();
        let started = Instant::now();
        let result = self
            .breaker
            .call(|| self.store.purchase(&request, now))
            .await;
        histogram!("seckill_purchase_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(PurchaseOutcome::Success { remaining_stock }) => Ok(remaining_stock),
            Ok(outcome) => {
                debug!(
                    product_id = request.product_id,
                    user_id = request.user_id,
                    outcome = ?outcome,
                    "Purchase rejected"
                );
                Err(SeckillResponse::rejected(outcome.into()))
            }
            Err(CircuitBreakerError::Inner(error)) => {
                error!(
                    product_id = request.product_id,
                    user_id = request.user_id,
                    error = %error,
                    "Purchase failed"
                );
                Err(SeckillResponse::rejected(SeckillCode::SystemError))
            }
            Err(rejection) => {
                warn!(product_id = request.product_id, reason = %rejection, "Purchase refused by circuit breaker");
                Err(SeckillResponse::rejected(SeckillCode::CircuitOpen))
            }
        }
    }

    /// Roll back a deduction that landed after its caller was answered with
    /// a timeout.
    async fn abandon(&self, request: PurchaseRequest) {
        counter!("seckill_late_purchases_total").increment(1);
        match self
            .store
            .rollback(request.product_id, request.user_id, request.quantity)
            .await
        {
            Ok(restored) => warn!(
                product_id = request.product_id,
                user_id = request.user_id,
                restored = ?restored,
                "Purchase finished after its deadline, deduction rolled back"
            ),
            Err(error) => error!(
                product_id = request.product_id,
                user_id = request.user_id,
                error = %error,
                "Failed to roll back a purchase that missed its deadline"
            ),
        }
    }

    /// Generate the order id and emit both messages. The purchase stands
    /// either way: a refused stock update is only logged, a refused order is
    /// handed to compensation.
    async fn settle(&self, request: PurchaseRequest, remaining_stock: i64) -> SeckillResponse {
        let now = self.clock.now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let order_id = format!("SK{}{}{}", request.product_id, request.user_id, nanos);
        let trace_id = format!("trace_{nanos}");

        let stock_update =
            StockUpdateMessage::new(request.product_id, remaining_stock, now, trace_id.clone());
        let _ = self
            .publish(&self.config.stock_topic, stock_update.to_envelope(), &order_id)
            .await;

        let order = OrderCreatedMessage::new(
            order_id.clone(),
            request.product_id,
            request.user_id,
            request.quantity,
            self.price_of(request.product_id),
            now,
            trace_id,
        );
        if let Err(error) = self
            .publish(&self.config.order_topic, order.to_envelope(), &order_id)
            .await
        {
            self.defer_order(&order, &error).await;
        }

        debug!(
            product_id = request.product_id,
            user_id = request.user_id,
            order_id = %order_id,
            remaining_stock,
            "Purchase succeeded"
        );
        SeckillResponse::succeeded(remaining_stock, order_id)
    }

    async fn publish(
        &self,
        topic: &str,
        envelope: Result<Envelope, MessageBusError>,
        order_id: &str,
    ) -> Result<(), MessageBusError> {
        let result = match envelope {
            Ok(envelope) => self.bus.publish(topic, &envelope).await,
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            warn!(topic, order_id, error = %error, "Failed to publish seckill message");
        }
        result
    }

    /// Record an order message the bus refused as an order-creation failure,
    /// due immediately.
    async fn defer_order(&self, order: &OrderCreatedMessage, error: &MessageBusError) {
        let Some(orders) = &self.orders else {
            error!(order_id = %order.order_id, error = %error, "Order message lost, no failure store configured");
            return;
        };
        let message_data = match serde_json::to_string(order) {
            Ok(data) => data,
            Err(encode_error) => {
                error!(order_id = %order.order_id, error = %encode_error, "Order message lost, cannot encode it");
                return;
            }
        };
        let failure = NewOrderFailure {
            order_id: order.order_id.clone(),
            user_id: order.user_id,
            product_id: order.product_id,
            failure_type: FAILURE_TYPE_ORDER_CREATION.to_string(),
            message_data,
            error_msg: error.to_string(),
            max_retries: self.config.order_max_retries,
            next_retry_at: self.clock.now(),
        };
        match orders.record_failure(failure).await {
            Ok(failure_id) => {
                counter!("order_failures_recorded_total").increment(1);
                warn!(failure_id, order_id = %order.order_id, "Order message not published, handed to compensation");
            }
            Err(record_error) => {
                error!(order_id = %order.order_id, error = %record_error, "Order message lost, failure record not written");
            }
        }
    }

    fn price_of(&self, product_id: i64) -> f64 {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&product_id)
            .copied()
            .unwrap_or(self.config.default_price)
    }

    fn record(&self, request: &PurchaseRequest, response: &SeckillResponse) {
        let code = response.kind();
        self.counters.record(code);
        let outcome = code.map_or("unknown", |code| code.label());
        counter!("seckill_requests_total", "outcome" => outcome).increment(1);
        if code.is_some_and(|code| code.is_overload()) {
            debug!(
                product_id = request.product_id,
                user_id = request.user_id,
                outcome,
                "Request shed"
            );
        }
    }

    async fn run(self: &Arc<Self>, queued: QueuedPurchase) -> SeckillResponse {
        let QueuedPurchase { request, deadline } = queued;
        let response = if tokio::time::Instant::now() >= deadline {
            debug!(
                product_id = request.product_id,
                user_id = request.user_id,
                "Queued purchase expired before a worker took it"
            );
            SeckillResponse::rejected(SeckillCode::RequestTimeout)
        } else {
            self.execute(request, deadline).await
        };
        self.record(&request, &response);
        response
    }
}

/// Result of an asynchronously submitted purchase.
///
/// Resolves once a queue worker finished the purchase, or with
/// [`SeckillCode::RequestTimeout`] if the purchase step did not answer by the
/// deadline. Dropping it abandons the answer; the purchase still runs.
pub struct PendingSeckill {
    completion: Completion<SeckillResponse>,
    request: PurchaseRequest,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PendingSeckill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSeckill")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Future for PendingSeckill {
    type Output = SeckillResponse;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        Pin::new(&mut this.completion).poll(cx).map(|result| {
            result.unwrap_or_else(|error| {
                let code = match error {
                    QueueError::Timeout => SeckillCode::RequestTimeout,
                    QueueError::Closed => SeckillCode::SystemBusy,
                    QueueError::Full | QueueError::Canceled | QueueError::Processing(_) => {
                        SeckillCode::SystemError
                    }
                };
                let response = SeckillResponse::rejected(code);
                this.shared.record(&this.request, &response);
                response
            })
        })
    }
}

/// Flash-sale request coordinator.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct SeckillCoordinator {
    shared: Arc<Shared>,
    inventory: Option<Arc<dyn InventoryStore>>,
    limiter: Arc<dyn Limiter>,
    busy_check: Option<BusyCheck>,
    degraded: AtomicBool,
    queue: RequestQueue<QueuedPurchase, SeckillResponse>,
}

impl std::fmt::Debug for SeckillCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeckillCoordinator")
            .field("config", &self.shared.config)
            .field("breaker", &self.shared.breaker)
            .field("limiter", &self.limiter)
            .field("degraded", &self.degraded.load(Ordering::Relaxed))
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl SeckillCoordinator {
    /// Start building a coordinator over a fast store and a message bus.
    #[must_use]
    pub fn builder(
        store: Arc<dyn FastStore>,
        bus: Arc<dyn MessageBus>,
    ) -> SeckillCoordinatorBuilder {
        SeckillCoordinatorBuilder {
            store,
            bus,
            inventory: None,
            orders: None,
            limiter: None,
            breaker: None,
            clock: None,
            busy_check: None,
            queue_config: QueueConfig::default(),
            config: CoordinatorConfig::default(),
        }
    }

    /// Process a purchase and wait for its answer.
    ///
    /// A purchase step that misses the configured deadline is answered with
    /// [`SeckillCode::RequestTimeout`] and leaves no deduction behind. A
    /// purchase that succeeded in time is answered once both messages were
    /// handed off.
    pub async fn process_seckill(&self, request: PurchaseRequest) -> SeckillResponse {
        let response = match self.admit(&request) {
            Err(rejection) => rejection,
            Ok(()) => {
                let deadline = tokio::time::Instant::now() + self.shared.config.request_timeout;
                self.shared.execute(request, deadline).await
            }
        };
        self.shared.record(&request, &response);
        response
    }

    /// Admit a purchase and queue it without waiting for the result.
    ///
    /// # Errors
    ///
    /// Returns the rejection immediately when admission fails or the queue
    /// is full ([`SeckillCode::QueueFull`]).
    pub fn process_seckill_async(
        &self,
        request: PurchaseRequest,
    ) -> Result<PendingSeckill, SeckillResponse> {
        if let Err(rejection) = self.admit(&request) {
            self.shared.record(&request, &rejection);
            return Err(rejection);
        }

        let id = format!("{}:{}", request.product_id, request.user_id);
        let queued = QueuedPurchase {
            request,
            deadline: tokio::time::Instant::now() + self.shared.config.request_timeout,
        };
        match self.queue.submit_async(id, queued, None) {
            Ok(completion) => Ok(PendingSeckill {
                completion,
                request,
                shared: Arc::clone(&self.shared),
            }),
            Err(error) => {
                let code = if error == QueueError::Full {
                    SeckillCode::QueueFull
                } else {
                    SeckillCode::SystemBusy
                };
                let rejection = SeckillResponse::rejected(code);
                self.shared.record(&request, &rejection);
                Err(rejection)
            }
        }
    }

    /// Queue a purchase and hand its result to `callback` on a spawned task.
    ///
    /// # Errors
    ///
    /// Returns the rejection immediately, without invoking `callback`, when
    /// admission fails or the queue is full.
    pub fn process_seckill_with_callback<C>(
        &self,
        request: PurchaseRequest,
        callback: C,
    ) -> Result<(), SeckillResponse>
    where
        C: FnOnce(SeckillResponse) + Send + 'static,
    {
        let pending = self.process_seckill_async(request)?;
        tokio::spawn(async move { callback(pending.await) });
        Ok(())
    }

    fn admit(&self, request: &PurchaseRequest) -> Result<(), SeckillResponse> {
        if !request.is_valid() {
            return Err(SeckillResponse::rejected(SeckillCode::InvalidQuantity)
                .with_message("invalid request parameters"));
        }
        if self.is_degraded() {
            return Err(SeckillResponse::rejected(SeckillCode::SystemBusy)
                .with_message(self.shared.config.degradation_message.clone()));
        }
        if !self.limiter.allow() {
            counter!("rate_limiter_rejections_total").increment(1);
            return Err(SeckillResponse::rejected(SeckillCode::RateLimited));
        }
        Ok(())
    }

    /// Whether purchases are currently rejected as busy.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire) || self.busy_check.as_ref().is_some_and(|check| check())
    }

    /// Switch degraded mode on or off.
    pub fn set_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::AcqRel);
        if was != degraded {
            info!(degraded, "Seckill degradation switched");
        }
    }

    /// Write the activity and its stock to the fast store and seed the
    /// durable inventory record if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for an invalid activity, or the
    /// error of either store.
    pub async fn preload_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        activity.validate()?;
        self.shared
            .store
            .preload_activity(activity, self.shared.config.activity_ttl)
            .await?;
        self.shared
            .prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(activity.product_id, activity.price);

        if let Some(inventory) = &self.inventory {
            let created = inventory
                .init_inventory(
                    activity.product_id,
                    &activity.product_name,
                    activity.stock,
                    self.shared.config.low_stock_threshold,
                )
                .await?;
            debug!(product_id = activity.product_id, created, "Durable inventory seeded");
        }

        info!(
            product_id = activity.product_id,
            stock = activity.stock,
            start = %activity.start_time,
            end = %activity.end_time,
            "Activity preloaded"
        );
        Ok(())
    }

    /// Remove the stock, buyer set and activity of a product.
    ///
    /// # Errors
    ///
    /// Returns the fast store's error.
    pub async fn cleanup_activity(&self, product_id: i64) -> Result<(), StoreError> {
        self.shared.store.cleanup(product_id).await?;
        self.shared
            .prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&product_id);
        info!(product_id, "Activity cleaned up");
        Ok(())
    }

    /// Current stock, buyer count and activity of a product.
    ///
    /// # Errors
    ///
    /// Returns the fast store's error.
    pub async fn product_stats(&self, product_id: i64) -> Result<ProductStats, StoreError> {
        self.shared.store.stats(product_id).await
    }

    /// Whether a user bought a product.
    ///
    /// # Errors
    ///
    /// Returns the fast store's error.
    pub async fn is_user_purchased(&self, product_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let purchased = self.shared.store.has_purchased(product_id, &[user_id]).await?;
        Ok(purchased.first().copied().unwrap_or(false))
    }

    /// Buyer-set membership for several users, in input order.
    ///
    /// # Errors
    ///
    /// Returns the fast store's error.
    pub async fn users_purchased(
        &self,
        product_id: i64,
        user_ids: &[i64],
    ) -> Result<Vec<bool>, StoreError> {
        self.shared.store.has_purchased(product_id, user_ids).await
    }

    /// The pending purchase record of a user.
    ///
    /// # Errors
    ///
    /// Returns the fast store's error.
    pub async fn pending_purchase(
        &self,
        product_id: i64,
        user_id: i64,
    ) -> Result<Option<PendingPurchase>, StoreError> {
        self.shared.store.pending_purchase(product_id, user_id).await
    }

    /// Service-level request counters.
    #[must_use]
    pub fn service_stats(&self) -> ServiceStats {
        self.shared.counters.snapshot()
    }

    /// Circuit breaker state.
    #[must_use]
    pub fn breaker_state(&self) -> State {
        self.shared.breaker.state()
    }

    /// Tokens left in the rate limiter.
    #[must_use]
    pub fn limiter_tokens(&self) -> u64 {
        self.limiter.remaining()
    }

    /// Request queue statistics.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Liveness of the fast store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if it does not answer.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.shared.store.ping().await
    }

    /// Stop the request queue. Queued purchases are answered with
    /// [`SeckillCode::SystemBusy`].
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        info!("Seckill coordinator stopped");
    }
}

/// Builder for [`SeckillCoordinator`].
pub struct SeckillCoordinatorBuilder {
    store: Arc<dyn FastStore>,
    bus: Arc<dyn MessageBus>,
    inventory: Option<Arc<dyn InventoryStore>>,
    orders: Option<Arc<dyn OrderStore>>,
    limiter: Option<Arc<dyn Limiter>>,
    breaker: Option<CircuitBreaker>,
    clock: Option<Arc<dyn Clock>>,
    busy_check: Option<BusyCheck>,
    queue_config: QueueConfig,
    config: CoordinatorConfig,
}

impl SeckillCoordinatorBuilder {
    /// Seed durable inventory on preload.
    #[must_use]
    pub fn inventory(mut self, inventory: Arc<dyn InventoryStore>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Failure store receiving order messages the bus refused.
    #[must_use]
    pub fn orders(mut self, orders: Arc<dyn OrderStore>) -> Self {
        self.orders = Some(orders);
        self
    }

    /// Admission limiter (default: admit everything).
    #[must_use]
    pub fn limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Breaker around the purchase step (default: `"seckill"` with default
    /// settings).
    #[must_use]
    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Time source of the activity window check and order ids.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Resource-pressure predicate consulted on every request.
    #[must_use]
    pub fn busy_check(mut self, check: BusyCheck) -> Self {
        self.busy_check = Some(check);
        self
    }

    /// Request queue sizing.
    #[must_use]
    pub const fn queue_config(mut self, queue_config: QueueConfig) -> Self {
        self.queue_config = queue_config;
        self
    }

    /// Coordinator settings.
    #[must_use]
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the coordinator and spawn its queue workers.
    ///
    /// Must run inside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> SeckillCoordinator {
        let degraded = AtomicBool::new(self.config.degradation_enabled);
        let shared = Arc::new(Shared {
            store: self.store,
            bus: self.bus,
            orders: self.orders,
            breaker: self
                .breaker
                .unwrap_or_else(|| CircuitBreaker::new("seckill", CircuitBreakerConfig::default())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
            counters: Counters::default(),
            prices: RwLock::new(HashMap::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let queue = RequestQueue::spawn(self.queue_config, move |queued: QueuedPurchase| {
            let shared = Arc::clone(&worker_shared);
            async move { Ok::<_, Infallible>(shared.run(queued).await) }
        });

        SeckillCoordinator {
            shared,
            inventory: self.inventory,
            limiter: self
                .limiter
                .unwrap_or_else(|| Arc::new(MultiLevelLimiter::new(Vec::new()))),
            busy_check: self.busy_check,
            degraded,
            queue,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use flashsale_core::activity::ActivityStatus;
    use chrono::{DateTime, Utc};
    use flashsale_core::message::{InboundMessage, DEFAULT_ORDER_TOPIC, DEFAULT_STOCK_TOPIC};
    use flashsale_core::message_bus::MessageStream;
    use flashsale_core::purchase::PurchaseStatus;
    use flashsale_runtime::TokenBucketLimiter;
    use flashsale_testing::{
        test_clock, test_epoch, InMemoryFastStore, InMemoryMessageBus, InMemoryOrderStore,
    };

    /// Bus that holds every publish for `delay` before handing it on.
    struct SlowBus {
        inner: Arc<InMemoryMessageBus>,
        delay: Duration,
    }

    impl MessageBus for SlowBus {
        fn publish(
            &self,
            topic: &str,
            envelope: &Envelope,
        ) -> Pin<Box<dyn Future<Output = Result<(), MessageBusError>> + Send + '_>> {
            let topic = topic.to_string();
            let envelope = envelope.clone();
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.inner.publish(&topic, &envelope).await
            })
        }

        fn subscribe(
            &self,
            topics: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<MessageStream, MessageBusError>> + Send + '_>> {
            self.inner.subscribe(topics)
        }
    }

    fn short_deadline(timeout: Duration) -> CoordinatorConfig {
        CoordinatorConfig {
            request_timeout: timeout,
            ..CoordinatorConfig::default()
        }
    }

    fn activity(product_id: i64, stock: i64) -> Activity {
        Activity {
            product_id,
            product_name: format!("product {product_id}"),
            price: 99.0,
            stock,
            start_time: test_epoch() - ChronoDuration::hours(1),
            end_time: test_epoch() + ChronoDuration::hours(1),
            status: ActivityStatus::Active,
        }
    }

    fn coordinator(
        store: &Arc<InMemoryFastStore>,
        bus: &Arc<InMemoryMessageBus>,
    ) -> SeckillCoordinatorBuilder {
        SeckillCoordinator::builder(store.clone(), bus.clone()).clock(Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn test_success_emits_stock_and_order_messages() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus).build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 42, 1))
            .await;

        assert!(response.success);
        assert_eq!(response.remaining_stock, 4);
        let order_id = response.order_id.unwrap();
        assert!(order_id.starts_with("SK142"));

        let orders = bus.published_to(DEFAULT_ORDER_TOPIC);
        assert_eq!(orders.len(), 1);
        assert!(matches!(
            orders[0].decode().unwrap(),
            InboundMessage::Order(ref order)
                if order.order_id == order_id
                    && (order.price - 99.0).abs() < f64::EPSILON
                    && order.trace_id.starts_with("trace_")
        ));

        let stock = bus.published_to(DEFAULT_STOCK_TOPIC);
        assert_eq!(stock.len(), 1);
        assert_eq!(stock[0].key, "1");
        assert_eq!(coordinator.service_stats().success_requests, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_the_purchase() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus).build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();
        bus.set_failing(true);

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 42, 1))
            .await;

        assert!(response.success);
        assert_eq!(store.stock(1).await.unwrap(), Some(4));
        assert!(coordinator.is_user_purchased(1, 42).await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_order_message_is_handed_to_compensation() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let orders = Arc::new(InMemoryOrderStore::new());
        let coordinator = coordinator(&store, &bus).orders(orders.clone()).build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();
        bus.set_failing(true);

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 42, 1))
            .await;

        assert!(response.success);
        let due = orders
            .due_failures(DateTime::<Utc>::MAX_UTC, DateTime::<Utc>::MIN_UTC, 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        let failure = &due[0];
        assert_eq!(failure.failure_type, FAILURE_TYPE_ORDER_CREATION);
        assert_eq!(Some(&failure.order_id), response.order_id.as_ref());
        assert_eq!(failure.next_retry_at, Some(test_epoch()));
        let message: OrderCreatedMessage = serde_json::from_str(&failure.message_data).unwrap();
        assert_eq!((message.product_id, message.user_id, message.quantity), (1, 42, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_publish_past_the_deadline_still_settles() {
        let store = Arc::new(InMemoryFastStore::new());
        let published = Arc::new(InMemoryMessageBus::new());
        let bus = Arc::new(SlowBus {
            inner: published.clone(),
            delay: Duration::from_millis(100),
        });
        let coordinator = SeckillCoordinator::builder(store.clone(), bus)
            .clock(Arc::new(test_clock()))
            .config(short_deadline(Duration::from_millis(50)))
            .build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 42, 1))
            .await;

        assert!(response.success);
        assert_eq!(response.remaining_stock, 4);
        let orders = published.published_to(DEFAULT_ORDER_TOPIC);
        assert_eq!(orders.len(), 1);
        assert!(matches!(
            orders[0].decode().unwrap(),
            InboundMessage::Order(ref order) if Some(&order.order_id) == response.order_id.as_ref()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_interrupt_settlement() {
        let store = Arc::new(InMemoryFastStore::new());
        let published = Arc::new(InMemoryMessageBus::new());
        let bus = Arc::new(SlowBus {
            inner: published.clone(),
            delay: Duration::from_millis(100),
        });
        let coordinator = SeckillCoordinator::builder(store.clone(), bus)
            .clock(Arc::new(test_clock()))
            .build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            coordinator.process_seckill(PurchaseRequest::new(1, 42, 1)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(published.published_to(DEFAULT_ORDER_TOPIC).len(), 1);
        assert_eq!(store.stock(1).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_admission() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus)
            .limiter(Arc::new(TokenBucketLimiter::new(1, 0.001)))
            .build();

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 0, 1))
            .await;

        assert_eq!(response.kind(), Some(SeckillCode::InvalidQuantity));
        assert_eq!(response.message, "invalid request parameters");
        assert_eq!(coordinator.limiter_tokens(), 1);
    }

    #[tokio::test]
    async fn test_degraded_mode_rejects_as_busy() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus).build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();

        coordinator.set_degraded(true);
        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 42, 1))
            .await;
        assert_eq!(response.kind(), Some(SeckillCode::SystemBusy));
        assert_eq!(response.message, "system busy, please retry later");

        coordinator.set_degraded(false);
        assert!(coordinator.process_seckill(PurchaseRequest::new(1, 42, 1)).await.success);
    }

    #[tokio::test]
    async fn test_busy_check_sheds_load() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus)
            .busy_check(Arc::new(|| true))
            .build();

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 42, 1))
            .await;

        assert_eq!(response.kind(), Some(SeckillCode::SystemBusy));
    }

    #[tokio::test]
    async fn test_rate_limited_requests_are_counted() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus)
            .limiter(Arc::new(TokenBucketLimiter::new(2, 0.001)))
            .build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();

        for user_id in 1..=3 {
            coordinator
                .process_seckill(PurchaseRequest::new(1, user_id, 1))
                .await;
        }

        let stats = coordinator.service_stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.success_requests, 2);
        assert_eq!(stats.rate_limited_requests, 1);
        assert_eq!(store.stock(1).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_store_outage_trips_the_breaker() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus).build();
        store.set_unavailable(true);

        for user_id in 1..=3 {
            let response = coordinator
                .process_seckill(PurchaseRequest::new(1, user_id, 1))
                .await;
            assert_eq!(response.kind(), Some(SeckillCode::SystemError));
        }

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 4, 1))
            .await;
        assert_eq!(response.kind(), Some(SeckillCode::CircuitOpen));
        assert_eq!(coordinator.breaker_state(), State::Open);
        assert_eq!(coordinator.service_stats().circuit_open_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_purchase_times_out_without_deducting() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus)
            .config(short_deadline(Duration::from_millis(20)))
            .build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();
        store.set_latency(Some(Duration::from_millis(200)));

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 42, 1))
            .await;
        assert_eq!(response.kind(), Some(SeckillCode::RequestTimeout));

        // The deduction lands after the deadline and is taken back
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.stock(1).await.unwrap(), Some(5));
        assert!(!coordinator.is_user_purchased(1, 42).await.unwrap());
        assert_eq!(
            store.pending_purchase(1, 42).await.unwrap().unwrap().status,
            PurchaseStatus::Failed
        );
        assert!(bus.published_to(DEFAULT_ORDER_TOPIC).is_empty());

        store.set_latency(None);
        assert!(coordinator.process_seckill(PurchaseRequest::new(1, 42, 1)).await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_purchase_missing_its_deadline_leaves_no_deduction() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus)
            .queue_config(QueueConfig::new(8, 1))
            .config(short_deadline(Duration::from_millis(45)))
            .build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();
        store.set_latency(Some(Duration::from_millis(20)));

        let pending: Vec<_> = (1..=3)
            .map(|user_id| {
                coordinator
                    .process_seckill_async(PurchaseRequest::new(1, user_id, 1))
                    .unwrap()
            })
            .collect();
        let mut responses = Vec::new();
        for pending in pending {
            responses.push(pending.await);
        }

        assert!(responses[0].success);
        assert!(responses[1].success);
        assert_eq!(responses[2].kind(), Some(SeckillCode::RequestTimeout));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.stock(1).await.unwrap(), Some(3));
        assert!(!coordinator.is_user_purchased(1, 3).await.unwrap());
        assert_eq!(bus.published_to(DEFAULT_ORDER_TOPIC).len(), 2);
    }

    #[tokio::test]
    async fn test_async_submission_resolves_through_the_queue() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus).build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();

        let pending = coordinator
            .process_seckill_async(PurchaseRequest::new(1, 42, 1))
            .unwrap();
        let response = pending.await;

        assert!(response.success);
        assert_eq!(coordinator.queue_stats().processed, 1);
        assert_eq!(coordinator.service_stats().success_requests, 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_reported_distinctly() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus)
            .queue_config(QueueConfig::new(1, 1))
            .build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();
        store.set_latency(Some(Duration::from_millis(50)));

        let first = coordinator.process_seckill_async(PurchaseRequest::new(1, 1, 1));
        let second = coordinator.process_seckill_async(PurchaseRequest::new(1, 2, 1));

        assert!(first.is_ok());
        assert_eq!(
            second.unwrap_err().kind(),
            Some(SeckillCode::QueueFull)
        );
        assert_eq!(coordinator.service_stats().queue_full_requests, 1);
    }

    #[tokio::test]
    async fn test_callback_receives_the_result() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus).build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        coordinator
            .process_seckill_with_callback(PurchaseRequest::new(1, 42, 1), move |response| {
                let _ = tx.send(response);
            })
            .unwrap();

        assert_eq!(rx.await.unwrap().remaining_stock, 4);
    }

    #[tokio::test]
    async fn test_cleanup_removes_the_activity() {
        let store = Arc::new(InMemoryFastStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let coordinator = coordinator(&store, &bus).build();
        coordinator.preload_activity(&activity(1, 5)).await.unwrap();

        coordinator.cleanup_activity(1).await.unwrap();

        let response = coordinator
            .process_seckill(PurchaseRequest::new(1, 42, 1))
            .await;
        assert_eq!(response.kind(), Some(SeckillCode::ActivityNotFound));
        assert!(coordinator.health_check().await.is_ok());
    }
}
