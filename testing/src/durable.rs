//! In-memory durable stores for orders and inventory.
//!
//! Each store keeps its state behind one mutex, so a "transaction" is simply
//! the critical section of one call. Failure injection switches let tests
//! exercise the compensation and retry paths.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flashsale_core::StoreError;
use flashsale_core::environment::{Clock, SystemClock};
use flashsale_core::inventory::{
    DiffStatus, InventoryAlert, InventoryDiff, InventoryLogEntry, InventoryOperation,
    InventoryRecord, InventoryStatus, NewInventoryDiff, SyncStockRequest, SyncStockResponse,
};
use flashsale_core::order::{
    CreateOrderOutcome, CreateOrderRequest, FailureStatus, NewOrderFailure, Order, OrderFailure,
    OrderStatus,
};
use flashsale_core::store::{InventoryStore, OrderStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
struct OrderState {
    orders: HashMap<String, Order>,
    idempotency: HashMap<(i64, i64), String>,
    failures: BTreeMap<i64, OrderFailure>,
    next_failure_id: i64,
}

/// In-memory [`OrderStore`].
#[derive(Clone)]
pub struct InMemoryOrderStore {
    state: Arc<Mutex<OrderState>>,
    failing_creates: Arc<AtomicU32>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryOrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOrderStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryOrderStore {
    /// Create an empty store stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OrderState::default())),
            failing_creates: Arc::new(AtomicU32::new(0)),
            clock,
        }
    }

    /// Make the next `n` order creations fail with a database error.
    pub fn fail_next_creates(&self, n: u32) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// Number of stored orders.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }

    /// Number of idempotency rows.
    #[must_use]
    pub fn idempotency_count(&self) -> usize {
        self.state.lock().unwrap().idempotency.len()
    }

    fn update_failure(
        &self,
        id: i64,
        update: impl FnOnce(&mut OrderFailure),
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let failure = state
            .failures
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("order failure {id}")))?;
        update(failure);
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create_order(
        &self,
        request: &CreateOrderRequest,
        expires_at: DateTime<Utc>,
    ) -> Result<CreateOrderOutcome, StoreError> {
        request.validate().map_err(StoreError::InvalidInput)?;
        if take_one(&self.failing_creates) {
            return Err(StoreError::Database("injected order insert failure".into()));
        }

        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.idempotency.get(&(request.user_id, request.product_id)) {
            return Ok(CreateOrderOutcome::Duplicate {
                existing_order_id: existing.clone(),
            });
        }

        let order = Order {
            order_id: request.order_id.clone(),
            user_id: request.user_id,
            product_id: request.product_id,
            product_name: request.product_name.clone(),
            quantity: request.quantity,
            price: request.price,
            total_amount: request.total_amount(),
            status: OrderStatus::Pending,
            order_type: request.order_type.clone(),
            trace_id: request.trace_id.clone(),
            created_at: self.clock.now(),
            expired_at: Some(expires_at),
        };
        state
            .idempotency
            .insert((request.user_id, request.product_id), order.order_id.clone());
        state.orders.insert(order.order_id.clone(), order.clone());
        Ok(CreateOrderOutcome::Created(order))
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.state.lock().unwrap().orders.get(order_id).cloned())
    }

    async fn record_failure(&self, failure: NewOrderFailure) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.next_failure_id += 1;
        let id = state.next_failure_id;
        state.failures.insert(
            id,
            OrderFailure {
                id,
                order_id: failure.order_id,
                user_id: failure.user_id,
                product_id: failure.product_id,
                failure_type: failure.failure_type,
                message_data: failure.message_data,
                error_msg: failure.error_msg,
                retry_count: 0,
                max_retries: failure.max_retries,
                next_retry_at: Some(failure.next_retry_at),
                status: FailureStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn due_failures(
        &self,
        now: DateTime<Utc>,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderFailure>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<OrderFailure> = state
            .failures
            .values()
            .filter(|f| f.is_due(now, created_after))
            .cloned()
            .collect();
        due.sort_by_key(|f| (f.next_retry_at, f.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn get_failure(&self, id: i64) -> Result<Option<OrderFailure>, StoreError> {
        Ok(self.state.lock().unwrap().failures.get(&id).cloned())
    }

    async fn set_failure_status(
        &self,
        id: i64,
        status: FailureStatus,
        error_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_failure(id, |failure| {
            failure.status = status;
            if let Some(error_msg) = error_msg {
                failure.error_msg = error_msg.to_string();
            }
            failure.updated_at = now;
        })
    }

    async fn schedule_retry(
        &self,
        id: i64,
        retry_count: u32,
        error_msg: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_failure(id, |failure| {
            failure.status = FailureStatus::Pending;
            failure.retry_count = retry_count;
            failure.error_msg = error_msg.to_string();
            failure.next_retry_at = Some(next_retry_at);
            failure.updated_at = now;
        })
    }

    async fn expire_failures(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderFailure>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut expired = Vec::new();
        for failure in state.failures.values_mut() {
            if matches!(failure.status, FailureStatus::Pending | FailureStatus::Processing)
                && failure.created_at < created_before
            {
                failure.status = FailureStatus::Expired;
                failure.updated_at = now;
                expired.push(failure.clone());
            }
        }
        Ok(expired)
    }

    async fn list_failures(
        &self,
        status: Option<FailureStatus>,
        limit: usize,
    ) -> Result<Vec<OrderFailure>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .failures
            .values()
            .rev()
            .filter(|f| status.is_none_or(|s| f.status == s))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct InventoryState {
    records: BTreeMap<i64, InventoryRecord>,
    log: Vec<InventoryLogEntry>,
    diffs: BTreeMap<i64, InventoryDiff>,
    alerts: Vec<InventoryAlert>,
    next_diff_id: i64,
}

impl InventoryState {
    fn append_log(&mut self, entry: InventoryLogEntry) {
        self.log.push(InventoryLogEntry {
            id: i64::try_from(self.log.len()).unwrap_or(i64::MAX) + 1,
            ..entry
        });
    }
}

/// In-memory [`InventoryStore`].
#[derive(Clone)]
pub struct InMemoryInventoryStore {
    state: Arc<Mutex<InventoryState>>,
    conflicts: Arc<AtomicU32>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryInventoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryInventoryStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryInventoryStore {
    /// Create an empty store stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InventoryState::default())),
            conflicts: Arc::new(AtomicU32::new(0)),
            clock,
        }
    }

    /// Make the next `n` stock syncs fail the version check.
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Alerts raised so far, oldest first.
    #[must_use]
    pub fn alerts(&self) -> Vec<InventoryAlert> {
        self.state.lock().unwrap().alerts.clone()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn init_inventory(
        &self,
        product_id: i64,
        product_name: &str,
        stock: i64,
        min_stock: i64,
    ) -> Result<bool, StoreError> {
        if stock < 0 {
            return Err(StoreError::InvalidInput(format!(
                "stock must not be negative, got {stock}"
            )));
        }
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        if state.records.contains_key(&product_id) {
            return Ok(false);
        }
        state.records.insert(
            product_id,
            InventoryRecord {
                product_id,
                product_name: product_name.to_string(),
                stock,
                reserved: 0,
                available: stock,
                version: 1,
                status: InventoryStatus::Active,
                min_stock,
                max_stock: stock,
                updated_at: now,
            },
        );
        state.append_log(InventoryLogEntry {
            id: 0,
            product_id,
            operation: InventoryOperation::Init,
            delta: stock,
            before_stock: 0,
            after_stock: stock,
            order_id: None,
            reason: "activity preload".into(),
            operator: "system".into(),
            trace_id: String::new(),
            created_at: now,
        });
        Ok(true)
    }

    async fn get_inventory(&self, product_id: i64) -> Result<Option<InventoryRecord>, StoreError> {
        Ok(self.state.lock().unwrap().records.get(&product_id).cloned())
    }

    async fn active_inventories(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|r| r.status == InventoryStatus::Active)
            .cloned()
            .collect())
    }

    async fn sync_stock(&self, request: &SyncStockRequest) -> Result<SyncStockResponse, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        if let Some(order_id) = &request.order_id {
            if let Some(applied) = state
                .log
                .iter()
                .find(|e| e.order_id.as_deref() == Some(order_id.as_str()))
            {
                return Ok(SyncStockResponse {
                    product_id: request.product_id,
                    before_stock: applied.before_stock,
                    after_stock: applied.after_stock,
                    delta: applied.delta,
                    success: true,
                    message: Some("already applied".into()),
                });
            }
        }

        if take_one(&self.conflicts) {
            return Err(StoreError::Conflict(format!(
                "inventory {} version moved",
                request.product_id
            )));
        }

        let record = state
            .records
            .entry(request.product_id)
            .or_insert_with(|| InventoryRecord {
                product_id: request.product_id,
                product_name: format!("product {}", request.product_id),
                stock: 0,
                reserved: 0,
                available: 0,
                version: 1,
                status: InventoryStatus::Active,
                min_stock: 0,
                max_stock: 0,
                updated_at: now,
            });

        let before_stock = record.stock;
        let after_stock = before_stock + request.delta;
        if after_stock < 0 {
            return Ok(SyncStockResponse::refused(
                request.product_id,
                before_stock,
                request.delta,
                "insufficient stock",
            ));
        }

        record.stock = after_stock;
        record.available = after_stock - record.reserved;
        record.version += 1;
        record.updated_at = now;

        state.append_log(InventoryLogEntry {
            id: 0,
            product_id: request.product_id,
            operation: InventoryOperation::for_delta(request.delta),
            delta: request.delta,
            before_stock,
            after_stock,
            order_id: request.order_id.clone(),
            reason: request.reason.clone(),
            operator: "system".into(),
            trace_id: request.trace_id.clone(),
            created_at: now,
        });

        Ok(SyncStockResponse {
            product_id: request.product_id,
            before_stock,
            after_stock,
            delta: request.delta,
            success: true,
            message: None,
        })
    }

    async fn operation_log(
        &self,
        product_id: i64,
        limit: usize,
    ) -> Result<Vec<InventoryLogEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .log
            .iter()
            .rev()
            .filter(|e| e.product_id == product_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_diff(&self, diff: NewInventoryDiff) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.next_diff_id += 1;
        let id = state.next_diff_id;
        state.diffs.insert(
            id,
            InventoryDiff {
                id,
                product_id: diff.product_id,
                durable_stock: diff.durable_stock,
                fast_stock: diff.fast_stock,
                diff: diff.diff(),
                status: DiffStatus::Pending,
                fixed_at: None,
                fixed_by: None,
                remark: None,
                created_at: now,
            },
        );
        Ok(id)
    }

    async fn get_diff(&self, id: i64) -> Result<Option<InventoryDiff>, StoreError> {
        Ok(self.state.lock().unwrap().diffs.get(&id).cloned())
    }

    async fn pending_diffs(&self, limit: usize) -> Result<Vec<InventoryDiff>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .diffs
            .values()
            .filter(|d| d.status == DiffStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn resolve_diff(
        &self,
        id: i64,
        status: DiffStatus,
        fixed_by: &str,
        remark: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.diffs.get_mut(&id) {
            Some(diff) if diff.status == DiffStatus::Pending => {
                diff.status = status;
                diff.fixed_at = Some(now);
                diff.fixed_by = Some(fixed_by.to_string());
                diff.remark = Some(remark.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_alert(&self, alert: &InventoryAlert) -> Result<(), StoreError> {
        self.state.lock().unwrap().alerts.push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{ManualClock, test_epoch};

    fn request(order_id: &str, user_id: i64) -> CreateOrderRequest {
        CreateOrderRequest {
            order_id: order_id.into(),
            user_id,
            product_id: 1001,
            product_name: "Phone".into(),
            quantity: 1,
            price: 1999.0,
            order_type: "seckill".into(),
            trace_id: "trace_1".into(),
        }
    }

    fn sync(delta: i64, order_id: Option<&str>) -> SyncStockRequest {
        SyncStockRequest {
            product_id: 1001,
            delta,
            order_id: order_id.map(str::to_string),
            reason: "seckill order".into(),
            trace_id: "trace_1".into(),
        }
    }

    #[tokio::test]
    async fn test_order_creation_is_idempotent_per_user_and_product() {
        let store = InMemoryOrderStore::new();
        let expires = Utc::now();

        let first = store.create_order(&request("SK1", 7), expires).await.unwrap();
        let replay = store.create_order(&request("SK2", 7), expires).await.unwrap();

        assert!(matches!(first, CreateOrderOutcome::Created(_)));
        assert_eq!(
            replay,
            CreateOrderOutcome::Duplicate {
                existing_order_id: "SK1".into()
            }
        );
        assert_eq!(store.order_count(), 1);
        assert_eq!(store.idempotency_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_create_failure_writes_nothing() {
        let store = InMemoryOrderStore::new();
        store.fail_next_creates(1);

        assert!(store.create_order(&request("SK1", 7), Utc::now()).await.is_err());
        assert_eq!(store.order_count(), 0);
        assert!(store.create_order(&request("SK1", 7), Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_lifecycle() {
        let clock = ManualClock::new(test_epoch());
        let store = InMemoryOrderStore::with_clock(Arc::new(clock.clone()));
        let id = store
            .record_failure(NewOrderFailure {
                order_id: "SK1".into(),
                user_id: 7,
                product_id: 1001,
                failure_type: "order_creation".into(),
                message_data: "{}".into(),
                error_msg: "db down".into(),
                max_retries: 3,
                next_retry_at: test_epoch() + chrono::Duration::seconds(1),
            })
            .await
            .unwrap();
        let horizon = test_epoch() - chrono::Duration::hours(24);

        assert!(store.due_failures(test_epoch(), horizon, 10).await.unwrap().is_empty());
        let later = test_epoch() + chrono::Duration::seconds(2);
        assert_eq!(store.due_failures(later, horizon, 10).await.unwrap().len(), 1);

        store
            .set_failure_status(id, FailureStatus::Processing, None, later)
            .await
            .unwrap();
        assert!(store.due_failures(later, horizon, 10).await.unwrap().is_empty());

        let expired = store
            .expire_failures(later + chrono::Duration::seconds(1), later)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(
            store.get_failure(id).await.unwrap().unwrap().status,
            FailureStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_sync_refuses_negative_stock() {
        let store = InMemoryInventoryStore::new();
        store.init_inventory(1001, "Phone", 1, 0).await.unwrap();

        let ok = store.sync_stock(&sync(-1, Some("SK1"))).await.unwrap();
        let refused = store.sync_stock(&sync(-1, Some("SK2"))).await.unwrap();

        assert!(ok.success);
        assert_eq!(ok.after_stock, 0);
        assert!(!refused.success);
        assert_eq!(refused.message.as_deref(), Some("insufficient stock"));
    }

    #[tokio::test]
    async fn test_sync_applies_each_order_once() {
        let store = InMemoryInventoryStore::new();
        store.init_inventory(1001, "Phone", 10, 0).await.unwrap();

        store.sync_stock(&sync(-1, Some("SK1"))).await.unwrap();
        let replay = store.sync_stock(&sync(-1, Some("SK1"))).await.unwrap();

        assert!(replay.success);
        let record = store.get_inventory(1001).await.unwrap().unwrap();
        assert_eq!(record.stock, 9);
        assert_eq!(record.version, 2);
        assert_eq!(store.operation_log(1001, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_creates_missing_record_and_reports_conflicts() {
        let store = InMemoryInventoryStore::new();
        store.inject_conflicts(1);

        assert!(matches!(
            store.sync_stock(&sync(5, None)).await,
            Err(StoreError::Conflict(_))
        ));
        let applied = store.sync_stock(&sync(5, None)).await.unwrap();

        assert_eq!(applied.before_stock, 0);
        assert_eq!(applied.after_stock, 5);
    }

    #[tokio::test]
    async fn test_diff_resolves_once() {
        let store = InMemoryInventoryStore::new();
        let id = store
            .record_diff(NewInventoryDiff {
                product_id: 1001,
                durable_stock: 90,
                fast_stock: 95,
            })
            .await
            .unwrap();

        assert_eq!(store.get_diff(id).await.unwrap().unwrap().diff, 5);
        assert!(store
            .resolve_diff(id, DiffStatus::Fixed, "auto", "use_db", Utc::now())
            .await
            .unwrap());
        assert!(!store
            .resolve_diff(id, DiffStatus::Ignored, "ops", "late", Utc::now())
            .await
            .unwrap());
        assert!(store.pending_diffs(10).await.unwrap().is_empty());
    }
}
