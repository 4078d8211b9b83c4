//! In-memory fast store and lock backend.
//!
//! One mutex guards all product state, so every purchase step is as
//! indivisible as the server-side script it stands in for. Activity and
//! purchase-record TTLs are not enforced.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flashsale_core::activity::Activity;
use flashsale_core::purchase::{
    PendingPurchase, ProductStats, PurchaseOutcome, PurchaseRequest, PurchaseStatus, StockSnapshot,
};
use flashsale_core::store::{FastStore, LockBackend};
use flashsale_core::StoreError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct ProductState {
    stock: Option<i64>,
    buyers: HashSet<i64>,
    activity: Option<Activity>,
    purchases: HashMap<i64, PendingPurchase>,
    unsettled: i64,
}

impl ProductState {
    fn settle_record(&mut self, user_id: i64, status: PurchaseStatus) {
        let Some(record) = self.purchases.get_mut(&user_id) else {
            return;
        };
        if record.status == PurchaseStatus::Pending && status != PurchaseStatus::Pending {
            self.unsettled = (self.unsettled - record.quantity).max(0);
        }
        record.status = status;
    }
}

/// In-memory [`FastStore`].
///
/// # Example
///
/// ```
/// use flashsale_testing::InMemoryFastStore;
///
/// let store = InMemoryFastStore::new();
/// store.set_unavailable(true); // every call now fails with `Unavailable`
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryFastStore {
    products: Arc<Mutex<HashMap<i64, ProductState>>>,
    unavailable: Arc<AtomicBool>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryFastStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every purchase by `latency` before it runs.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap() = latency;
    }

    /// User ids in the buyer set of a product, sorted.
    #[must_use]
    pub fn buyers(&self, product_id: i64) -> Vec<i64> {
        let products = self.products.lock().unwrap();
        let mut buyers: Vec<i64> = products
            .get(&product_id)
            .map(|p| p.buyers.iter().copied().collect())
            .unwrap_or_default();
        buyers.sort_unstable();
        buyers
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected fast store outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn preload_activity(&self, activity: &Activity, _ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        activity.validate()?;
        let mut products = self.products.lock().unwrap();
        let product = products.entry(activity.product_id).or_default();
        product.stock = Some(activity.stock);
        product.activity = Some(activity.clone());
        Ok(())
    }

    async fn purchase(
        &self,
        request: &PurchaseRequest,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome, StoreError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.check_available()?;

        if request.quantity <= 0 {
            return Ok(PurchaseOutcome::InvalidQuantity);
        }

        let mut products = self.products.lock().unwrap();
        let Some(product) = products.get_mut(&request.product_id) else {
            return Ok(PurchaseOutcome::ActivityNotFound);
        };
        let Some(activity) = &product.activity else {
            return Ok(PurchaseOutcome::ActivityNotFound);
        };
        if now < activity.start_time {
            return Ok(PurchaseOutcome::ActivityNotStarted);
        }
        if now >= activity.end_time {
            return Ok(PurchaseOutcome::ActivityEnded);
        }
        if product.buyers.contains(&request.user_id) {
            return Ok(PurchaseOutcome::AlreadyBought);
        }
        let Some(stock) = product.stock else {
            return Ok(PurchaseOutcome::StockNotFound);
        };
        if stock < request.quantity {
            return Ok(PurchaseOutcome::InsufficientStock);
        }

        let remaining_stock = stock - request.quantity;
        product.stock = Some(remaining_stock);
        product.buyers.insert(request.user_id);
        product.purchases.insert(
            request.user_id,
            PendingPurchase {
                user_id: request.user_id,
                product_id: request.product_id,
                quantity: request.quantity,
                purchase_time: now,
                status: PurchaseStatus::Pending,
            },
        );
        product.unsettled += request.quantity;
        Ok(PurchaseOutcome::Success { remaining_stock })
    }

    async fn rollback(
        &self,
        product_id: i64,
        user_id: i64,
        quantity: i64,
    ) -> Result<Option<i64>, StoreError> {
        self.check_available()?;
        let mut products = self.products.lock().unwrap();
        let Some(product) = products.get_mut(&product_id) else {
            return Ok(None);
        };
        let Some(stock) = product.stock else {
            return Ok(None);
        };
        if !product.buyers.remove(&user_id) {
            return Ok(None);
        }
        let restored = stock + quantity;
        product.stock = Some(restored);
        product.settle_record(user_id, PurchaseStatus::Failed);
        Ok(Some(restored))
    }

    async fn stock(&self, product_id: i64) -> Result<Option<i64>, StoreError> {
        self.check_available()?;
        Ok(self
            .products
            .lock()
            .unwrap()
            .get(&product_id)
            .and_then(|p| p.stock))
    }

    async fn stock_snapshot(&self, product_id: i64) -> Result<Option<StockSnapshot>, StoreError> {
        self.check_available()?;
        Ok(self.products.lock().unwrap().get(&product_id).and_then(|p| {
            p.stock.map(|stock| StockSnapshot {
                stock,
                unsettled: p.unsettled,
            })
        }))
    }

    async fn overwrite_stock(&self, product_id: i64, stock: i64) -> Result<(), StoreError> {
        self.check_available()?;
        if stock < 0 {
            return Err(StoreError::InvalidInput(format!(
                "stock must not be negative, got {stock}"
            )));
        }
        self.products
            .lock()
            .unwrap()
            .entry(product_id)
            .or_default()
            .stock = Some(stock);
        Ok(())
    }

    async fn compare_and_set_stock(
        &self,
        product_id: i64,
        expected: i64,
        new: i64,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        if new < 0 {
            return Err(StoreError::InvalidInput(format!(
                "stock must not be negative, got {new}"
            )));
        }
        let mut products = self.products.lock().unwrap();
        match products.get_mut(&product_id) {
            Some(product) if product.stock == Some(expected) => {
                product.stock = Some(new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn has_purchased(&self, product_id: i64, user_ids: &[i64]) -> Result<Vec<bool>, StoreError> {
        self.check_available()?;
        let products = self.products.lock().unwrap();
        let buyers = products.get(&product_id).map(|p| &p.buyers);
        Ok(user_ids
            .iter()
            .map(|user_id| buyers.is_some_and(|b| b.contains(user_id)))
            .collect())
    }

    async fn stats(&self, product_id: i64) -> Result<ProductStats, StoreError> {
        self.check_available()?;
        let products = self.products.lock().unwrap();
        let product = products.get(&product_id);
        Ok(ProductStats {
            product_id,
            current_stock: product.and_then(|p| p.stock).unwrap_or(0),
            buyer_count: product.map_or(0, |p| i64::try_from(p.buyers.len()).unwrap_or(i64::MAX)),
            activity: product.and_then(|p| p.activity.clone()),
        })
    }

    async fn pending_purchase(
        &self,
        product_id: i64,
        user_id: i64,
    ) -> Result<Option<PendingPurchase>, StoreError> {
        self.check_available()?;
        Ok(self
            .products
            .lock()
            .unwrap()
            .get(&product_id)
            .and_then(|p| p.purchases.get(&user_id).cloned()))
    }

    async fn mark_purchase(
        &self,
        product_id: i64,
        user_id: i64,
        status: PurchaseStatus,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(product) = self.products.lock().unwrap().get_mut(&product_id) {
            product.settle_record(user_id, status);
        }
        Ok(())
    }

    async fn cleanup(&self, product_id: i64) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(product) = self.products.lock().unwrap().get_mut(&product_id) {
            product.stock = None;
            product.buyers.clear();
            product.activity = None;
            product.unsettled = 0;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

/// In-memory [`LockBackend`] with lease expiry on the Tokio clock.
///
/// Expiry follows `tokio::time`, so paused-time tests can advance past a TTL.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockBackend {
    leases: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryLockBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_owner(leases: &mut HashMap<String, (String, Instant)>, key: &str) -> Option<String> {
        match leases.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                leases.remove(key);
                None
            }
            Some((token, _)) => Some(token.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().unwrap();
        if Self::live_owner(&mut leases, key).is_some() {
            return Ok(false);
        }
        leases.insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().unwrap();
        if Self::live_owner(&mut leases, key).as_deref() == Some(token) {
            leases.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn expire_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().unwrap();
        if Self::live_owner(&mut leases, key).as_deref() == Some(token) {
            leases.insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn owner(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(Self::live_owner(&mut self.leases.lock().unwrap(), key))
    }
}
