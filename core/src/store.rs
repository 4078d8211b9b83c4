//! Collaborator traits for the fast path and the durable side.
//!
//! - [`FastStore`]: low-latency shared store holding the stock counter, the
//!   buyer set and the activity definition. Every purchase step runs as one
//!   indivisible unit inside the store.
//! - [`LockBackend`]: compare-and-set primitives the distributed lock is built
//!   on.
//! - [`OrderStore`]: transactional orders, idempotency rows and order-failure
//!   records.
//! - [`InventoryStore`]: versioned durable stock, its operation log, drift
//!   records and alerts.
//!
//! All traits are object safe and used behind `Arc<dyn ...>`.

use crate::activity::Activity;
use crate::error::StoreError;
use crate::inventory::{
    DiffStatus, InventoryAlert, InventoryDiff, InventoryLogEntry, InventoryRecord,
    NewInventoryDiff, SyncStockRequest, SyncStockResponse,
};
use crate::order::{
    CreateOrderOutcome, CreateOrderRequest, FailureStatus, NewOrderFailure, Order, OrderFailure,
};
use crate::purchase::{
    PendingPurchase, ProductStats, PurchaseOutcome, PurchaseRequest, PurchaseStatus, StockSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Fast-path store for flash-sale state.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Write the stock counter and activity definition, both expiring after
    /// `ttl`. Overwrites a previous preload of the same product.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn preload_activity(&self, activity: &Activity, ttl: Duration) -> Result<(), StoreError>;

    /// Run the atomic purchase protocol.
    ///
    /// Checks quantity, the activity window at `now`, buyer-set membership and
    /// stock; on success decrements stock, adds the user to the buyer set and
    /// writes a pending purchase record, all indivisibly.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] only for store failures. Business rejections
    /// are [`PurchaseOutcome`] variants.
    async fn purchase(
        &self,
        request: &PurchaseRequest,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome, StoreError>;

    /// Reverse a successful deduction: re-increment stock, remove the user
    /// from the buyer set and mark the purchase record failed.
    ///
    /// Returns the stock after the rollback, or `None` when the user never
    /// bought or the stock counter is gone (no-op). A cleaned-up or expired
    /// product is never recreated.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn rollback(
        &self,
        product_id: i64,
        user_id: i64,
        quantity: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// Current stock counter, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn stock(&self, product_id: i64) -> Result<Option<i64>, StoreError>;

    /// Stock counter and unsettled units read in one step, `None` when the
    /// stock counter is absent.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn stock_snapshot(&self, product_id: i64) -> Result<Option<StockSnapshot>, StoreError>;

    /// Overwrite the stock counter. Only reconciliation calls this, under the
    /// product's distributed lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for a negative value.
    async fn overwrite_stock(&self, product_id: i64, stock: i64) -> Result<(), StoreError>;

    /// Set the stock counter to `new` only if it still holds `expected`,
    /// keeping its expiry. Returns whether the counter was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for a negative `new`.
    async fn compare_and_set_stock(
        &self,
        product_id: i64,
        expected: i64,
        new: i64,
    ) -> Result<bool, StoreError>;

    /// Buyer-set membership for several users, in input order.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn has_purchased(&self, product_id: i64, user_ids: &[i64]) -> Result<Vec<bool>, StoreError>;

    /// Stock, buyer count and activity of a product.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn stats(&self, product_id: i64) -> Result<ProductStats, StoreError>;

    /// The pending purchase record of a user, if it has not expired.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn pending_purchase(
        &self,
        product_id: i64,
        user_id: i64,
    ) -> Result<Option<PendingPurchase>, StoreError>;

    /// Update the status of a pending purchase record, keeping its expiry.
    /// Moving a record out of pending releases its units from the unsettled
    /// count. A missing record is ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn mark_purchase(
        &self,
        product_id: i64,
        user_id: i64,
        status: PurchaseStatus,
    ) -> Result<(), StoreError>;

    /// Delete stock, buyer set, activity and unsettled count of a product.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn cleanup(&self, product_id: i64) -> Result<(), StoreError>;

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store does not answer.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Primitives a distributed lock is built on.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` with a TTL only if absent. Returns whether the
    /// key was set.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it still holds `token`. Returns whether it was
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    /// Reset the TTL of `key` only if it still holds `token`. Returns whether
    /// the TTL was reset.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn expire_if_owner(&self, key: &str, token: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Current owner token of `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store is unreachable.
    async fn owner(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Durable order storage.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Create an order in one transaction.
    ///
    /// Checks the (user, product) idempotency row first; a hit returns
    /// [`CreateOrderOutcome::Duplicate`] without writing. Otherwise inserts
    /// the order, its line item and the idempotency row together.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for an invalid request and
    /// [`StoreError::Database`] if the transaction fails; nothing is written
    /// in either case.
    async fn create_order(
        &self,
        request: &CreateOrderRequest,
        expires_at: DateTime<Utc>,
    ) -> Result<CreateOrderOutcome, StoreError>;

    /// Load an order by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError>;

    /// Persist a new failure record with status pending and retry count 0.
    /// Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    async fn record_failure(&self, failure: NewOrderFailure) -> Result<i64, StoreError>;

    /// Pending records whose next retry is at or before `now`, with retries
    /// left, created after `created_after`, oldest retry time first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn due_failures(
        &self,
        now: DateTime<Utc>,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderFailure>, StoreError>;

    /// Load a failure record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn get_failure(&self, id: i64) -> Result<Option<OrderFailure>, StoreError>;

    /// Set the status of a failure record, optionally replacing its error text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    async fn set_failure_status(
        &self,
        id: i64,
        status: FailureStatus,
        error_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Return a failure record to pending with a new retry count, error text
    /// and next retry time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    async fn schedule_retry(
        &self,
        id: i64,
        retry_count: u32,
        error_msg: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark pending or processing records created before `created_before` as
    /// expired and return them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    async fn expire_failures(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderFailure>, StoreError>;

    /// Failure records, optionally filtered by status, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn list_failures(
        &self,
        status: Option<FailureStatus>,
        limit: usize,
    ) -> Result<Vec<OrderFailure>, StoreError>;
}

/// Durable inventory storage.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Create an active inventory record with an `init` log row if none
    /// exists. Returns whether a record was created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for negative stock.
    async fn init_inventory(
        &self,
        product_id: i64,
        product_name: &str,
        stock: i64,
        min_stock: i64,
    ) -> Result<bool, StoreError>;

    /// Load an inventory record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn get_inventory(&self, product_id: i64) -> Result<Option<InventoryRecord>, StoreError>;

    /// All records with status active.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn active_inventories(&self) -> Result<Vec<InventoryRecord>, StoreError>;

    /// Apply a signed delta under an optimistic version check and log it.
    ///
    /// - a missing record is created with zero stock first
    /// - a delta that would make stock negative is refused with
    ///   `success = false`
    /// - a request whose order id already has a log row succeeds without
    ///   applying the delta again
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the version moved between read and
    /// write; the caller should retry.
    async fn sync_stock(&self, request: &SyncStockRequest) -> Result<SyncStockResponse, StoreError>;

    /// Most recent log rows of a product, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn operation_log(
        &self,
        product_id: i64,
        limit: usize,
    ) -> Result<Vec<InventoryLogEntry>, StoreError>;

    /// Persist a pending drift record. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    async fn record_diff(&self, diff: NewInventoryDiff) -> Result<i64, StoreError>;

    /// Load a drift record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn get_diff(&self, id: i64) -> Result<Option<InventoryDiff>, StoreError>;

    /// Pending drift records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn pending_diffs(&self, limit: usize) -> Result<Vec<InventoryDiff>, StoreError>;

    /// Resolve a pending drift record. Returns `false` if it was not pending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    async fn resolve_diff(
        &self,
        id: i64,
        status: DiffStatus,
        fixed_by: &str,
        remark: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Persist an alert.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    async fn create_alert(&self, alert: &InventoryAlert) -> Result<(), StoreError>;
}
