//! Purchase serialized by the product's distributed lock.
//!
//! The purchase script is already atomic; this wrapper is for callers that
//! need a multi-step sequence around it (membership check, deduction, record)
//! to be exclusive per product, such as administrative tools running against
//! a live sale. Lock contention beyond the retry budget is reported as
//! "system busy", never as a hard error.

use chrono::{DateTime, Utc};
use flashsale_core::keys;
use flashsale_core::purchase::{PurchaseOutcome, PurchaseRequest, SeckillCode};
use flashsale_core::store::{FastStore, LockBackend};
use flashsale_core::{LockError, StoreError};
use flashsale_runtime::lock::DistributedLock;
use std::sync::Arc;
use std::time::Duration;

/// Lease held while the guarded sequence runs.
pub const GUARD_LOCK_TTL: Duration = Duration::from_secs(10);
/// Pause between acquisition attempts.
pub const GUARD_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Acquisition attempts before giving up.
pub const GUARD_MAX_ATTEMPTS: usize = 50;

/// Result of a guarded purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedOutcome {
    /// The sequence ran under the lock
    Completed(PurchaseOutcome),
    /// The lock stayed busy for the whole retry budget
    Busy {
        /// Attempts made
        attempts: usize,
    },
}

impl GuardedOutcome {
    /// Client-visible code.
    #[must_use]
    pub fn code(&self) -> SeckillCode {
        match self {
            Self::Completed(outcome) => SeckillCode::from(*outcome),
            Self::Busy { .. } => SeckillCode::SystemBusy,
        }
    }
}

/// Lock-guarded purchase over any fast store and lock backend.
#[derive(Clone)]
pub struct GuardedPurchase {
    store: Arc<dyn FastStore>,
    locks: Arc<dyn LockBackend>,
    retry_interval: Duration,
    max_attempts: usize,
}

impl GuardedPurchase {
    /// Guard `store` with locks from `locks`, using the default budget
    /// (100ms between attempts, 50 attempts).
    #[must_use]
    pub fn new(store: Arc<dyn FastStore>, locks: Arc<dyn LockBackend>) -> Self {
        Self {
            store,
            locks,
            retry_interval: GUARD_RETRY_INTERVAL,
            max_attempts: GUARD_MAX_ATTEMPTS,
        }
    }

    /// Override the acquisition budget.
    #[must_use]
    pub const fn with_retry_budget(mut self, retry_interval: Duration, max_attempts: usize) -> Self {
        self.retry_interval = retry_interval;
        self.max_attempts = max_attempts;
        self
    }

    /// Take the product lock, reject a known buyer, then run the purchase.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store or the lock backend fails.
    pub async fn purchase(
        &self,
        request: &PurchaseRequest,
        now: DateTime<Utc>,
    ) -> Result<GuardedOutcome, StoreError> {
        let lock = DistributedLock::new(
            Arc::clone(&self.locks),
            keys::lock_key(request.product_id),
            GUARD_LOCK_TTL,
        );

        let result = lock
            .run_exclusive(self.retry_interval, self.max_attempts, || async {
                let already = self
                    .store
                    .has_purchased(request.product_id, &[request.user_id])
                    .await?;
                if already.first().copied().unwrap_or(false) {
                    return Ok(PurchaseOutcome::AlreadyBought);
                }
                self.store.purchase(request, now).await
            })
            .await;

        match result {
            Ok(outcome) => Ok(GuardedOutcome::Completed(outcome?)),
            Err(LockError::Busy { key, attempts }) => {
                tracing::warn!(key = %key, attempts, "Guarded purchase gave up on busy lock");
                Ok(GuardedOutcome::Busy { attempts })
            }
            Err(LockError::Backend(error)) => Err(error),
            Err(other) => Err(StoreError::Unavailable(other.to_string())),
        }
    }
}

impl std::fmt::Debug for GuardedPurchase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedPurchase")
            .field("retry_interval", &self.retry_interval)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flashsale_core::activity::{Activity, ActivityStatus};
    use flashsale_testing::{InMemoryFastStore, InMemoryLockBackend, test_epoch};

    const PRODUCT: i64 = 1001;

    async fn setup(stock: i64) -> (Arc<InMemoryFastStore>, Arc<InMemoryLockBackend>) {
        let store = Arc::new(InMemoryFastStore::new());
        store
            .preload_activity(
                &Activity {
                    product_id: PRODUCT,
                    product_name: "Phone".into(),
                    price: 1999.0,
                    stock,
                    start_time: test_epoch(),
                    end_time: test_epoch() + chrono::Duration::hours(1),
                    status: ActivityStatus::Active,
                },
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        (store, Arc::new(InMemoryLockBackend::new()))
    }

    fn now() -> DateTime<Utc> {
        test_epoch() + chrono::Duration::minutes(1)
    }

    #[tokio::test]
    async fn test_guarded_purchase_deducts_once() {
        let (store, locks) = setup(5).await;
        let guarded = GuardedPurchase::new(store.clone(), locks.clone());
        let request = PurchaseRequest::new(PRODUCT, 7, 1);

        let first = guarded.purchase(&request, now()).await.unwrap();
        let second = guarded.purchase(&request, now()).await.unwrap();

        assert_eq!(first.code(), SeckillCode::Success);
        assert_eq!(second, GuardedOutcome::Completed(PurchaseOutcome::AlreadyBought));
        assert_eq!(store.stock(PRODUCT).await.unwrap(), Some(4));
        assert_eq!(locks.owner(&keys::lock_key(PRODUCT)).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_lock_maps_to_system_busy() {
        let (store, locks) = setup(5).await;
        assert!(locks
            .set_if_absent(&keys::lock_key(PRODUCT), "someone-else", Duration::from_secs(60))
            .await
            .unwrap());
        let guarded = GuardedPurchase::new(store.clone(), locks)
            .with_retry_budget(Duration::from_millis(100), 3);

        let outcome = guarded
            .purchase(&PurchaseRequest::new(PRODUCT, 7, 1), now())
            .await
            .unwrap();

        assert_eq!(outcome, GuardedOutcome::Busy { attempts: 3 });
        assert_eq!(outcome.code(), SeckillCode::SystemBusy);
        assert_eq!(store.stock(PRODUCT).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let (store, locks) = setup(5).await;
        store.set_unavailable(true);
        let guarded = GuardedPurchase::new(store, locks);

        let result = guarded.purchase(&PurchaseRequest::new(PRODUCT, 7, 1), now()).await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
