//! Redis-backed [`FastStore`].
//!
//! # Keys
//!
//! - `seckill:stock:{product}`: stock counter (string integer)
//! - `seckill:users:{product}`: buyer set
//! - `seckill:activity:{product}`: activity JSON, times as epoch millis
//! - `seckill:purchase:{product}:{user}`: pending purchase JSON, 1h TTL
//! - `seckill:unsettled:{product}`: units whose purchase record is pending
//!
//! Purchase, rollback, status changes, snapshots, stock compare-and-set,
//! batch check and stats each run as one Lua script.

use crate::scripts::Scripts;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flashsale_core::StoreError;
use flashsale_core::activity::Activity;
use flashsale_core::keys;
use flashsale_core::purchase::{
    PendingPurchase, ProductStats, PurchaseOutcome, PurchaseRequest, PurchaseStatus, StockSnapshot,
};
use flashsale_core::store::FastStore;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Value};
use std::time::Duration;

/// Map a Redis error onto the store taxonomy.
pub(crate) fn store_error(context: &str, error: &RedisError) -> StoreError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_timeout() {
        StoreError::Unavailable(format!("{context}: {error}"))
    } else {
        StoreError::Script(format!("{context}: {error}"))
    }
}

/// Open a connection manager for `redis_url`.
pub(crate) async fn connect(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let client = Client::open(redis_url)
        .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {e}")))?;

    ConnectionManager::new(client).await.map_err(|e| {
        StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
    })
}

/// Fast store on Redis.
///
/// Cheap to clone; clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisFastStore {
    conn_manager: ConnectionManager,
    scripts: Scripts,
}

impl RedisFastStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the connection cannot be opened.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        Ok(Self::from_connection(connect(redis_url).await?))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_connection(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            scripts: Scripts::new(),
        }
    }

    /// The underlying connection, shared with a lock backend.
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.conn_manager.clone()
    }

    fn decode_purchase_reply(reply: &Value) -> Result<PurchaseOutcome, StoreError> {
        match reply {
            Value::Int(code) => PurchaseOutcome::from_code(*code, None),
            Value::Array(items) => {
                let values: Vec<i64> = items
                    .iter()
                    .map(|item| match item {
                        Value::Int(n) => Ok(*n),
                        other => Err(StoreError::Script(format!(
                            "unexpected purchase reply element {other:?}"
                        ))),
                    })
                    .collect::<Result<_, _>>()?;
                match values.as_slice() {
                    [code, remaining] => PurchaseOutcome::from_code(*code, Some(*remaining)),
                    [code] => PurchaseOutcome::from_code(*code, None),
                    _ => Err(StoreError::Script(format!(
                        "unexpected purchase reply length {}",
                        values.len()
                    ))),
                }
            }
            other => Err(StoreError::Script(format!(
                "unexpected purchase reply {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for RedisFastStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFastStore")
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn preload_activity(&self, activity: &Activity, ttl: Duration) -> Result<(), StoreError> {
        activity.validate()?;
        let mut conn = self.conn_manager.clone();
        let activity_json = serde_json::to_string(activity)?;
        let ttl_secs = ttl.as_secs().max(1);

        let _: () = redis::pipe()
            .atomic()
            .set_ex(keys::stock_key(activity.product_id), activity.stock, ttl_secs)
            .ignore()
            .set_ex(keys::activity_key(activity.product_id), activity_json, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to preload activity", &e))?;

        tracing::info!(
            product_id = activity.product_id,
            stock = activity.stock,
            ttl_secs,
            "Preloaded activity into Redis"
        );
        Ok(())
    }

    async fn purchase(
        &self,
        request: &PurchaseRequest,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome, StoreError> {
        let mut conn = self.conn_manager.clone();
        let reply: Value = self
            .scripts
            .purchase
            .key(keys::stock_key(request.product_id))
            .key(keys::buyers_key(request.product_id))
            .key(keys::activity_key(request.product_id))
            .key(keys::purchase_key(request.product_id, request.user_id))
            .key(keys::unsettled_key(request.product_id))
            .arg(request.user_id)
            .arg(request.quantity)
            .arg(now.timestamp_millis())
            .arg(request.product_id)
            .arg(keys::PURCHASE_RECORD_TTL_SECS)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Purchase script failed", &e))?;

        let outcome = Self::decode_purchase_reply(&reply)?;
        tracing::debug!(
            product_id = request.product_id,
            user_id = request.user_id,
            code = outcome.code(),
            "Purchase script finished"
        );
        Ok(outcome)
    }

    async fn rollback(
        &self,
        product_id: i64,
        user_id: i64,
        quantity: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let restored: Option<i64> = self
            .scripts
            .rollback
            .key(keys::stock_key(product_id))
            .key(keys::buyers_key(product_id))
            .key(keys::purchase_key(product_id, user_id))
            .key(keys::unsettled_key(product_id))
            .arg(user_id)
            .arg(quantity)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Rollback script failed", &e))?;

        match restored {
            Some(stock) => tracing::info!(product_id, user_id, quantity, stock, "Rolled back purchase"),
            None => tracing::debug!(
                product_id,
                user_id,
                "Rollback skipped, user is not a buyer or stock is gone"
            ),
        }
        Ok(restored)
    }

    async fn stock(&self, product_id: i64) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.get(keys::stock_key(product_id))
            .await
            .map_err(|e| store_error("Failed to read stock", &e))
    }

    async fn stock_snapshot(&self, product_id: i64) -> Result<Option<StockSnapshot>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let snapshot: Option<(i64, i64)> = self
            .scripts
            .snapshot
            .key(keys::stock_key(product_id))
            .key(keys::unsettled_key(product_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Snapshot script failed", &e))?;
        Ok(snapshot.map(|(stock, unsettled)| StockSnapshot { stock, unsettled }))
    }

    async fn overwrite_stock(&self, product_id: i64, stock: i64) -> Result<(), StoreError> {
        if stock < 0 {
            return Err(StoreError::InvalidInput(format!(
                "stock must not be negative, got {stock}"
            )));
        }
        let mut conn = self.conn_manager.clone();
        let _: () = redis::cmd("SET")
            .arg(keys::stock_key(product_id))
            .arg(stock)
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to overwrite stock", &e))?;
        Ok(())
    }

    async fn compare_and_set_stock(
        &self,
        product_id: i64,
        expected: i64,
        new: i64,
    ) -> Result<bool, StoreError> {
        if new < 0 {
            return Err(StoreError::InvalidInput(format!(
                "stock must not be negative, got {new}"
            )));
        }
        let mut conn = self.conn_manager.clone();
        let written: i64 = self
            .scripts
            .cas_stock
            .key(keys::stock_key(product_id))
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Stock compare-and-set failed", &e))?;
        Ok(written == 1)
    }

    async fn has_purchased(&self, product_id: i64, user_ids: &[i64]) -> Result<Vec<bool>, StoreError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();
        let mut invocation = self.scripts.batch_check.key(keys::buyers_key(product_id));
        for user_id in user_ids {
            invocation.arg(*user_id);
        }
        let flags: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Batch check script failed", &e))?;
        Ok(flags.into_iter().map(|flag| flag == 1).collect())
    }

    async fn stats(&self, product_id: i64) -> Result<ProductStats, StoreError> {
        let mut conn = self.conn_manager.clone();
        let (current_stock, buyer_count, activity_json): (i64, i64, String) = self
            .scripts
            .stats
            .key(keys::stock_key(product_id))
            .key(keys::buyers_key(product_id))
            .key(keys::activity_key(product_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Stats script failed", &e))?;

        let activity = if activity_json.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&activity_json)?)
        };
        Ok(ProductStats {
            product_id,
            current_stock,
            buyer_count,
            activity,
        })
    }

    async fn pending_purchase(
        &self,
        product_id: i64,
        user_id: i64,
    ) -> Result<Option<PendingPurchase>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let record: Option<String> = conn
            .get(keys::purchase_key(product_id, user_id))
            .await
            .map_err(|e| store_error("Failed to read purchase record", &e))?;
        record
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn mark_purchase(
        &self,
        product_id: i64,
        user_id: i64,
        status: PurchaseStatus,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let found: i64 = self
            .scripts
            .mark_purchase
            .key(keys::purchase_key(product_id, user_id))
            .key(keys::unsettled_key(product_id))
            .arg(status.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Mark purchase script failed", &e))?;

        if found == 0 {
            tracing::debug!(product_id, user_id, "Purchase record already expired");
        }
        Ok(())
    }

    async fn cleanup(&self, product_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(&[
                keys::stock_key(product_id),
                keys::buyers_key(product_id),
                keys::activity_key(product_id),
                keys::unsettled_key(product_id),
            ])
            .await
            .map_err(|e| store_error("Failed to clean up product", &e))?;

        tracing::info!(product_id, "Cleaned up flash-sale keys");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Redis ping failed: {e}")))?;
        Ok(())
    }
}
