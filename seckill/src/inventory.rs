//! Durable stock synchronization.
//!
//! [`InventorySync`] applies signed deltas to the durable inventory with an
//! optimistic version check, retrying on conflicts, and raises low-stock and
//! out-of-stock alerts after every successful write.

use flashsale_core::inventory::{InventoryAlert, SyncStockRequest, SyncStockResponse};
use flashsale_core::store::InventoryStore;
use flashsale_core::StoreError;
use flashsale_runtime::metrics::counter;
use flashsale_runtime::retry::retry_with_predicate;
use flashsale_runtime::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;

/// Conflict-retrying writer over an [`InventoryStore`].
#[derive(Clone)]
pub struct InventorySync {
    store: Arc<dyn InventoryStore>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for InventorySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventorySync")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl InventorySync {
    /// Retry version conflicts up to `max_retries` times with short backoff.
    #[must_use]
    pub fn new(store: Arc<dyn InventoryStore>, max_retries: u32) -> Self {
        let policy = RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(200))
            .build();
        Self::with_policy(store, policy)
    }

    /// Use an explicit conflict retry policy.
    #[must_use]
    pub const fn with_policy(store: Arc<dyn InventoryStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    /// Apply `request.delta` to the durable stock.
    ///
    /// A refused delta (stock would go negative) comes back as
    /// `success = false`, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] once the retry budget is spent, or
    /// any non-conflict store error immediately.
    pub async fn sync(&self, request: &SyncStockRequest) -> Result<SyncStockResponse, StoreError> {
        let response = retry_with_predicate(
            &self.policy,
            || async {
                let result = self.store.sync_stock(request).await;
                if matches!(result, Err(StoreError::Conflict(_))) {
                    counter!("inventory_sync_conflicts_total").increment(1);
                }
                result
            },
            |error| matches!(error, StoreError::Conflict(_)),
        )
        .await?;

        if response.success {
            tracing::debug!(
                product_id = request.product_id,
                delta = request.delta,
                before = response.before_stock,
                after = response.after_stock,
                trace_id = %request.trace_id,
                "Inventory synchronized"
            );
            self.check_stock_level(request.product_id, response.after_stock)
                .await;
        } else {
            tracing::warn!(
                product_id = request.product_id,
                delta = request.delta,
                stock = response.before_stock,
                "Inventory sync refused"
            );
        }
        Ok(response)
    }

    async fn check_stock_level(&self, product_id: i64, stock: i64) {
        let min_stock = match self.store.get_inventory(product_id).await {
            Ok(Some(record)) => record.min_stock,
            Ok(None) => 0,
            Err(error) => {
                tracing::warn!(product_id, error = %error, "Failed to load inventory for alert check");
                return;
            }
        };

        let Some(alert) = InventoryAlert::for_stock_level(product_id, stock, min_stock) else {
            return;
        };
        counter!("inventory_alerts_total", "kind" => alert.kind.as_str()).increment(1);
        if let Err(error) = self.store.create_alert(&alert).await {
            tracing::warn!(product_id, error = %error, "Failed to persist inventory alert");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flashsale_core::inventory::AlertKind;
    use flashsale_testing::InMemoryInventoryStore;

    fn request(product_id: i64, delta: i64, order_id: &str) -> SyncStockRequest {
        SyncStockRequest {
            product_id,
            delta,
            order_id: Some(order_id.to_string()),
            reason: "order settled".into(),
            trace_id: "trace".into(),
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = Arc::new(InMemoryInventoryStore::new());
        store.init_inventory(1, "phone", 10, 2).await.unwrap();
        store.inject_conflicts(2);

        let sync = InventorySync::new(store.clone(), 3);
        let response = sync.sync(&request(1, -1, "SK-a")).await.unwrap();

        assert!(response.success);
        assert_eq!(response.after_stock, 9);
    }

    #[tokio::test]
    async fn test_conflict_budget_is_bounded() {
        let store = Arc::new(InMemoryInventoryStore::new());
        store.init_inventory(1, "phone", 10, 2).await.unwrap();
        store.inject_conflicts(5);

        let sync = InventorySync::new(store.clone(), 1);
        let result = sync.sync(&request(1, -1, "SK-a")).await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(store.get_inventory(1).await.unwrap().unwrap().stock, 10);
    }

    #[tokio::test]
    async fn test_low_and_empty_stock_raise_alerts() {
        let store = Arc::new(InMemoryInventoryStore::new());
        store.init_inventory(1, "phone", 3, 2).await.unwrap();
        let sync = InventorySync::new(store.clone(), 0);

        sync.sync(&request(1, -1, "SK-a")).await.unwrap();
        sync.sync(&request(1, -2, "SK-b")).await.unwrap();

        let kinds: Vec<AlertKind> = store.alerts().iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::LowStock, AlertKind::OutOfStock]);
    }

    #[tokio::test]
    async fn test_negative_result_is_refused_not_failed() {
        let store = Arc::new(InMemoryInventoryStore::new());
        store.init_inventory(1, "phone", 1, 0).await.unwrap();
        let sync = InventorySync::new(store.clone(), 0);

        let response = sync.sync(&request(1, -2, "SK-a")).await.unwrap();

        assert!(!response.success);
        assert!(store.alerts().is_empty());
    }
}
