//! Redis [`LockBackend`]: `SET NX PX` to take a lease, token-checked Lua
//! scripts to release and renew it.

use crate::scripts::Scripts;
use crate::store::{connect, store_error};
use async_trait::async_trait;
use flashsale_core::StoreError;
use flashsale_core::store::LockBackend;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// Lock backend on Redis.
#[derive(Clone)]
pub struct RedisLockBackend {
    conn_manager: ConnectionManager,
    scripts: Scripts,
}

impl RedisLockBackend {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the connection cannot be opened.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        Ok(Self::from_connection(connect(redis_url).await?))
    }

    /// Share an existing connection, typically the fast store's.
    #[must_use]
    pub fn from_connection(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            scripts: Scripts::new(),
        }
    }
}

impl std::fmt::Debug for RedisLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockBackend").finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_truncation)] // Lease lengths are far below u64::MAX ms
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to set lock", &e))?;
        Ok(reply.is_some())
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = self
            .scripts
            .lock_release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Lock release script failed", &e))?;
        Ok(deleted == 1)
    }

    async fn expire_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let renewed: i64 = self
            .scripts
            .lock_renew
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Lock renew script failed", &e))?;
        Ok(renewed == 1)
    }

    async fn owner(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.get(key)
            .await
            .map_err(|e| store_error("Failed to read lock owner", &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5000);
    }
}
