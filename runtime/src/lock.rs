//! Advisory distributed lock over a [`LockBackend`].
//!
//! Each [`DistributedLock`] owns a random token. Acquisition sets the key to
//! the token only if absent; release and renewal are compare-and-act on the
//! token, so an owner whose lease expired can never delete a lock that someone
//! else has since taken.
//!
//! Used for multi-step sequences that cannot run as one atomic script, such as
//! overwriting the fast-path stock during reconciliation.
//!
//! # Example
//!
//! ```rust,no_run
//! use flashsale_runtime::lock::DistributedLock;
//! # use flashsale_core::store::LockBackend;
//! # use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(backend: Arc<dyn LockBackend>) -> Result<(), Box<dyn std::error::Error>> {
//! let lock = DistributedLock::new(backend, "seckill:lock:1001", Duration::from_secs(5));
//!
//! let written = lock
//!     .run_exclusive(Duration::from_millis(100), 50, || async { 42 })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use flashsale_core::LockError;
use flashsale_core::store::LockBackend;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};

/// Lease on a single key with a unique owner token.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    ttl: Duration,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Create a lock handle for `key` with a fresh owner token.
    ///
    /// Nothing is written until [`DistributedLock::acquire`].
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            key: key.into(),
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }

    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// This owner's token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Lease length.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lock once.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotAcquired`] if another owner holds it.
    pub async fn acquire(&self) -> Result<(), LockError> {
        if self.backend.set_if_absent(&self.key, &self.token, self.ttl).await? {
            tracing::debug!(key = %self.key, "Lock acquired");
            Ok(())
        } else {
            Err(LockError::NotAcquired(self.key.clone()))
        }
    }

    /// Take the lock, retrying every `retry_interval` up to `max_attempts` times.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Busy`] when every attempt found the lock held, or
    /// a backend error immediately.
    pub async fn try_acquire(
        &self,
        retry_interval: Duration,
        max_attempts: usize,
    ) -> Result<(), LockError> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.acquire().await {
                Ok(()) => return Ok(()),
                Err(LockError::NotAcquired(_)) if attempt < attempts => sleep(retry_interval).await,
                Err(LockError::NotAcquired(_)) => break,
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(key = %self.key, attempts, "Lock still busy, giving up");
        Err(LockError::Busy {
            key: self.key.clone(),
            attempts,
        })
    }

    /// Release the lock if this owner still holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHeld`] if the lease expired or was taken over.
    pub async fn release(&self) -> Result<(), LockError> {
        if self.backend.delete_if_owner(&self.key, &self.token).await? {
            tracing::debug!(key = %self.key, "Lock released");
            Ok(())
        } else {
            Err(LockError::NotHeld(self.key.clone()))
        }
    }

    /// Extend the lease by a full TTL.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHeld`] if this owner lost the lock.
    pub async fn renew(&self) -> Result<(), LockError> {
        if self.backend.expire_if_owner(&self.key, &self.token, self.ttl).await? {
            Ok(())
        } else {
            Err(LockError::NotHeld(self.key.clone()))
        }
    }

    /// Whether the key currently holds this owner's token.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store is unreachable.
    pub async fn is_held(&self) -> Result<bool, LockError> {
        Ok(self.backend.owner(&self.key).await?.as_deref() == Some(self.token.as_str()))
    }

    /// Acquire, then keep renewing every `renew_every` until the returned
    /// handle is released or dropped.
    ///
    /// A failed renewal is logged and stops the renewal loop; the lease then
    /// runs out on its own.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotAcquired`] if another owner holds the lock.
    pub async fn acquire_with_auto_renew(&self, renew_every: Duration) -> Result<LockHandle, LockError> {
        self.acquire().await?;

        let lock = self.clone();
        let renewal = tokio::spawn(async move {
            let mut ticker = interval(renew_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = lock.renew().await {
                    tracing::warn!(key = %lock.key, error = %error, "Lock renewal failed, stopping");
                    break;
                }
            }
        });

        Ok(LockHandle {
            lock: self.clone(),
            renewal,
        })
    }

    /// Run `operation` while holding the lock, releasing it afterwards.
    ///
    /// A failed release after the operation completed is logged, not
    /// returned: the lease has expired and the work is already done.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Busy`] if the lock could not be taken within the
    /// retry budget; `operation` is not run in that case.
    pub async fn run_exclusive<F, Fut, T>(
        &self,
        retry_interval: Duration,
        max_attempts: usize,
        operation: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.try_acquire(retry_interval, max_attempts).await?;
        let output = operation().await;
        if let Err(error) = self.release().await {
            tracing::warn!(key = %self.key, error = %error, "Lock expired before release");
        }
        Ok(output)
    }
}

/// Held lock with a background renewal task.
///
/// Dropping the handle stops renewal but leaves the key to expire; call
/// [`LockHandle::release`] to free it immediately.
#[derive(Debug)]
pub struct LockHandle {
    lock: DistributedLock,
    renewal: JoinHandle<()>,
}

impl LockHandle {
    /// The underlying lock.
    #[must_use]
    pub const fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Stop renewing and release the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHeld`] if the lease was lost meanwhile.
    pub async fn release(self) -> Result<(), LockError> {
        self.renewal.abort();
        self.lock.release().await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flashsale_testing::InMemoryLockBackend;

    const KEY: &str = "seckill:lock:1001";

    fn backend() -> Arc<dyn LockBackend> {
        Arc::new(InMemoryLockBackend::new())
    }

    #[tokio::test]
    async fn test_second_owner_is_refused_until_release() {
        let backend = backend();
        let first = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(5));
        let second = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(5));

        first.acquire().await.unwrap();
        assert_eq!(second.acquire().await, Err(LockError::NotAcquired(KEY.into())));
        assert!(first.is_held().await.unwrap());
        assert!(!second.is_held().await.unwrap());

        first.release().await.unwrap();
        second.acquire().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_owner_cannot_release_new_owner() {
        let backend = backend();
        let stale = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(1));
        let fresh = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(5));

        stale.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        fresh.acquire().await.unwrap();

        assert_eq!(stale.release().await, Err(LockError::NotHeld(KEY.into())));
        assert_eq!(stale.renew().await, Err(LockError::NotHeld(KEY.into())));
        assert!(fresh.is_held().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_acquisition_reports_busy() {
        let backend = backend();
        let holder = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(30));
        let waiter = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(30));
        holder.acquire().await.unwrap();

        let result = waiter.try_acquire(Duration::from_millis(100), 3).await;

        assert_eq!(
            result,
            Err(LockError::Busy {
                key: KEY.into(),
                attempts: 3
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_acquisition_succeeds_once_released() {
        let backend = backend();
        let holder = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(30));
        let waiter = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(30));
        holder.acquire().await.unwrap();

        let releaser = tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            holder.release().await
        });

        waiter.try_acquire(Duration::from_millis(100), 10).await.unwrap();
        releaser.await.unwrap().unwrap();
        assert!(waiter.is_held().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_renew_outlives_ttl() {
        let backend = backend();
        let lock = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(1));
        let other = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(1));

        let handle = lock
            .acquire_with_auto_renew(Duration::from_millis(300))
            .await
            .unwrap();
        sleep(Duration::from_secs(3)).await;

        assert!(handle.lock().is_held().await.unwrap());
        assert!(other.acquire().await.is_err());

        handle.release().await.unwrap();
        other.acquire().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_lets_lease_expire() {
        let backend = backend();
        let lock = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(1));
        let other = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(1));

        let handle = lock
            .acquire_with_auto_renew(Duration::from_millis(300))
            .await
            .unwrap();
        drop(handle);
        sleep(Duration::from_secs(2)).await;

        other.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_afterwards() {
        let backend = backend();
        let lock = DistributedLock::new(Arc::clone(&backend), KEY, Duration::from_secs(5));

        let value = lock
            .run_exclusive(Duration::from_millis(10), 3, || async { 7 })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert!(!lock.is_held().await.unwrap());
    }
}
