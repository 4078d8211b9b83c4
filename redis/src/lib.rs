//! # Flashsale Redis
//!
//! Redis implementations of the fast-path collaborators:
//!
//! - [`RedisFastStore`]: stock counter, buyer set, activity and pending
//!   purchase records, with purchase/rollback/batch-check/stats as Lua
//!   scripts
//! - [`RedisLockBackend`]: `SET NX PX` leases with token-checked release and
//!   renewal
//! - [`GuardedPurchase`]: purchase serialized by the product's distributed
//!   lock, reporting contention as "system busy"
//!
//! # Example
//!
//! ```no_run
//! use flashsale_redis::{RedisFastStore, RedisLockBackend};
//! use flashsale_core::store::FastStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisFastStore::new("redis://127.0.0.1:6379").await?;
//! let locks = RedisLockBackend::from_connection(store.connection());
//! store.ping().await?;
//! # Ok(())
//! # }
//! ```

mod guarded;
mod lock;
pub mod scripts;
mod store;

pub use guarded::{
    GUARD_LOCK_TTL, GUARD_MAX_ATTEMPTS, GUARD_RETRY_INTERVAL, GuardedOutcome, GuardedPurchase,
};
pub use lock::RedisLockBackend;
pub use store::RedisFastStore;
