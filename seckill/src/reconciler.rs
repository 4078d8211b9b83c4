//! Inventory reconciler.
//!
//! Audits every active product on a schedule: compares the fast-path stock
//! counter with the durable inventory, records drift beyond the tolerance,
//! alerts on large drift and heals small drift automatically.
//!
//! Durable stock only moves once an order settles, so units deducted on the
//! fast path whose purchase records are still pending are added back before
//! comparing: the fast side is `stock + unsettled`. A sale in flight is
//! therefore never drift. The tolerance absorbs a settlement landing between
//! the two reads of one check.
//!
//! Two fix directions exist:
//!
//! - [`FixType::UseDb`]: set the fast-path counter to the durable stock less
//!   the unsettled units, under the product's distributed lock and with a
//!   compare-and-set so a purchase landing meanwhile is never overwritten
//! - [`FixType::UseRedis`]: apply the drift to the durable stock through
//!   [`InventorySync`], so the operation log stays complete
//!
//! Both fixes re-read the fast side before and after the durable side and
//! give up with [`ReconcileError::StockMoved`] when it moved in between.

use crate::config::{FixPolicy, ReconcileConfig};
use crate::inventory::InventorySync;
use chrono::{DateTime, Utc};
use flashsale_core::environment::{Clock, SystemClock};
use flashsale_core::inventory::{
    AlertKind, AlertLevel, DiffStatus, FixType, InventoryAlert, InventoryDiff, InventoryRecord,
    NewInventoryDiff, SyncStockRequest,
};
use flashsale_core::keys;
use flashsale_core::purchase::StockSnapshot;
use flashsale_core::store::{FastStore, LockBackend};
use flashsale_core::{LockError, StoreError};
use flashsale_runtime::metrics::counter;
use flashsale_runtime::DistributedLock;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Errors from the inventory reconciler.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// A store call failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The distributed lock failed
    #[error("Lock error: {0}")]
    Lock(LockError),

    /// Drift record or inventory record missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// The drift record was already resolved
    #[error("Diff {0} is not pending")]
    NotPending(i64),

    /// The product lock stayed busy; the drift is left pending
    #[error("Lock for product {product_id} is busy")]
    LockBusy {
        /// Product id
        product_id: i64,
    },

    /// Fast-path stock moved while a fix was computed; the drift is left
    /// pending for the next cycle
    #[error("Stock of product {product_id} moved during the fix")]
    StockMoved {
        /// Product id
        product_id: i64,
    },

    /// Durable inventory refused the adjustment
    #[error("Inventory sync refused for product {product_id}: {reason}")]
    SyncRefused {
        /// Product id
        product_id: i64,
        /// Refusal message
        reason: String,
    },
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between cycles
    pub interval: Duration,
    /// Largest drift ignored, absorbing a settlement that lands between the
    /// two reads of a check
    pub tolerance: i64,
    /// Drift above which an alert is raised
    pub alert_threshold: i64,
    /// Heal drift automatically
    pub auto_fix: bool,
    /// Largest drift healed automatically
    pub max_fix_amount: i64,
    /// Direction of automatic fixes
    pub fix_policy: FixPolicy,
    /// Lease of the product lock
    pub lock_ttl: Duration,
    /// Pause between lock attempts
    pub lock_retry_interval: Duration,
    /// Lock attempts before giving up
    pub lock_attempts: usize,
}

impl ReconcilerConfig {
    /// Extract the reconciler settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            tolerance: config.tolerance,
            alert_threshold: config.alert_threshold,
            auto_fix: config.auto_fix,
            max_fix_amount: config.max_fix_amount,
            fix_policy: config.fix_policy,
            lock_ttl: config.lock_ttl(),
            lock_retry_interval: Duration::from_millis(50),
            lock_attempts: 3,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default())
    }
}

/// Result of auditing one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductHealth {
    /// Product id
    pub product_id: i64,
    /// Durable stock at check time
    pub durable_stock: i64,
    /// Fast-path stock at check time
    pub fast_stock: i64,
    /// Units deducted on the fast path and not yet settled
    pub unsettled: i64,
    /// `fast_stock + unsettled - durable_stock`
    pub diff: i64,
    /// Drift record written for this check
    pub diff_id: Option<i64>,
    /// Fix applied automatically
    pub fixed: Option<FixType>,
}

impl ProductHealth {
    /// Whether both sides agreed within tolerance.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.diff_id.is_none()
    }
}

/// Reconciler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Cycles run
    pub checks: u64,
    /// Drift records written
    pub diffs_found: u64,
    /// Drift healed automatically
    pub auto_fixed: u64,
    /// Drift alerts raised
    pub alerts_sent: u64,
    /// Start of the last cycle
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Periodic fast-path versus durable stock audit.
pub struct InventoryReconciler {
    fast: Arc<dyn FastStore>,
    locks: Arc<dyn LockBackend>,
    inventory: InventorySync,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    stats: Mutex<ReconcileStats>,
}

impl std::fmt::Debug for InventoryReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryReconciler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl InventoryReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        fast: Arc<dyn FastStore>,
        locks: Arc<dyn LockBackend>,
        inventory: InventorySync,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            fast,
            locks,
            inventory,
            clock: Arc::new(SystemClock),
            config,
            stats: Mutex::new(ReconcileStats::default()),
        }
    }

    /// Use a custom clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn update_stats(&self, f: impl FnOnce(&mut ReconcileStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Audit every active product once.
    ///
    /// A product whose check fails is logged and skipped; products without a
    /// fast-path counter are not part of a running sale and are skipped too.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] if the active products could not be
    /// listed.
    pub async fn run_cycle(&self) -> Result<Vec<ProductHealth>, ReconcileError> {
        let now = self.clock.now();
        self.update_stats(|stats| {
            stats.checks += 1;
            stats.last_check_time = Some(now);
        });

        let records = self.inventory.store().active_inventories().await?;
        let mut report = Vec::with_capacity(records.len());
        for record in records {
            match self.check_product(&record).await {
                Ok(Some(health)) => report.push(health),
                Ok(None) => {}
                Err(error) => {
                    error!(product_id = record.product_id, error = %error, "Reconciliation check failed");
                }
            }
        }

        debug!(products = report.len(), "Reconciliation cycle finished");
        Ok(report)
    }

    async fn check_product(
        &self,
        record: &InventoryRecord,
    ) -> Result<Option<ProductHealth>, ReconcileError> {
        let product_id = record.product_id;
        let Some(snapshot) = self.fast.stock_snapshot(product_id).await? else {
            debug!(product_id, "No fast-path counter, skipped");
            return Ok(None);
        };
        // Durable read after the snapshot, see `stable_reading`
        let durable_stock = self.durable_stock(product_id).await?;

        let observed = NewInventoryDiff {
            product_id,
            durable_stock,
            fast_stock: snapshot.expected_durable(),
        };
        let diff = observed.diff();
        let mut health = ProductHealth {
            product_id,
            durable_stock,
            fast_stock: snapshot.stock,
            unsettled: snapshot.unsettled,
            diff,
            diff_id: None,
            fixed: None,
        };
        if diff.abs() <= self.config.tolerance {
            return Ok(Some(health));
        }

        let diff_id = self.inventory.store().record_diff(observed).await?;
        health.diff_id = Some(diff_id);
        self.update_stats(|stats| stats.diffs_found += 1);
        counter!("inventory_diffs_found_total").increment(1);
        warn!(
            product_id,
            diff_id,
            durable_stock,
            fast_stock = snapshot.stock,
            unsettled = snapshot.unsettled,
            diff,
            "Inventory drift found"
        );

        if diff.abs() > self.config.alert_threshold {
            self.raise_drift_alert(&health).await;
        }

        if self.config.auto_fix && diff.abs() <= self.config.max_fix_amount {
            let fix_type = self.config.fix_policy.choose(diff);
            let remark = format!("auto fixed with {}", fix_type.as_str());
            match self.apply_fix(diff_id, product_id, fix_type, "system", &remark).await {
                Ok(()) => {
                    health.fixed = Some(fix_type);
                    self.update_stats(|stats| stats.auto_fixed += 1);
                    counter!("inventory_auto_fixed_total").increment(1);
                }
                Err(error) => {
                    warn!(product_id, diff_id, error = %error, "Automatic fix failed, drift left pending");
                }
            }
        }

        Ok(Some(health))
    }

    async fn raise_drift_alert(&self, health: &ProductHealth) {
        let alert = InventoryAlert {
            product_id: health.product_id,
            kind: AlertKind::DiffAlert,
            level: AlertLevel::Error,
            message: format!(
                "inventory drift of {} (fast path {} with {} unsettled, durable {})",
                health.diff, health.fast_stock, health.unsettled, health.durable_stock
            ),
        };
        counter!("inventory_alerts_total", "kind" => alert.kind.as_str()).increment(1);
        self.update_stats(|stats| stats.alerts_sent += 1);
        error!(product_id = health.product_id, diff = health.diff, "Inventory drift above alert threshold");
        if let Err(error) = self.inventory.store().create_alert(&alert).await {
            warn!(product_id = health.product_id, error = %error, "Failed to persist drift alert");
        }
    }

    /// Converge one product in the chosen direction and resolve its drift
    /// record. Both sides are re-read so a fix applied long after detection
    /// does not undo sales made in between.
    async fn apply_fix(
        &self,
        diff_id: i64,
        product_id: i64,
        fix_type: FixType,
        fixed_by: &str,
        remark: &str,
    ) -> Result<(), ReconcileError> {
        match fix_type {
            FixType::UseDb => {
                let lock = DistributedLock::new(
                    self.locks.clone(),
                    keys::lock_key(product_id),
                    self.config.lock_ttl,
                );
                let stock = lock
                    .run_exclusive(
                        self.config.lock_retry_interval,
                        self.config.lock_attempts,
                        || self.reset_fast_stock(product_id),
                    )
                    .await
                    .map_err(|error| match error {
                        LockError::Busy { .. } => ReconcileError::LockBusy { product_id },
                        other => ReconcileError::Lock(other),
                    })??;
                info!(product_id, diff_id, stock, "Fast-path stock reset from durable inventory");
            }
            FixType::UseRedis => {
                let (snapshot, durable) = self.stable_reading(product_id).await?;
                let delta = snapshot.expected_durable() - durable;
                if delta != 0 {
                    let response = self
                        .inventory
                        .sync(&SyncStockRequest {
                            product_id,
                            delta,
                            order_id: None,
                            reason: "reconciliation fix".into(),
                            trace_id: format!("reconcile-fix-{diff_id}"),
                        })
                        .await?;
                    if !response.success {
                        return Err(ReconcileError::SyncRefused {
                            product_id,
                            reason: response.message.unwrap_or_default(),
                        });
                    }
                }
                info!(product_id, diff_id, delta, "Durable inventory adjusted to fast-path stock");
            }
        }

        let resolved = self
            .inventory
            .store()
            .resolve_diff(diff_id, DiffStatus::Fixed, fixed_by, remark, self.clock.now())
            .await?;
        if resolved {
            Ok(())
        } else {
            Err(ReconcileError::NotPending(diff_id))
        }
    }

    /// Set the fast-path counter to durable stock less the unsettled units.
    /// The write only lands if no purchase moved the counter since it was
    /// read. Returns the stock written.
    async fn reset_fast_stock(&self, product_id: i64) -> Result<i64, ReconcileError> {
        let (snapshot, durable) = self.stable_reading(product_id).await?;
        let target = (durable - snapshot.unsettled).max(0);
        if target == snapshot.stock {
            return Ok(target);
        }
        if self
            .fast
            .compare_and_set_stock(product_id, snapshot.stock, target)
            .await?
        {
            Ok(target)
        } else {
            Err(ReconcileError::StockMoved { product_id })
        }
    }

    /// Fast side, durable side, then the fast side again.
    ///
    /// Settlement writes durable stock before it releases unsettled units, so
    /// reading the fast side first can only make durable look low, which
    /// errs towards underselling. A fast side that moved across the durable
    /// read is refused.
    async fn stable_reading(&self, product_id: i64) -> Result<(StockSnapshot, i64), ReconcileError> {
        let before = self.snapshot(product_id).await?;
        let durable = self.durable_stock(product_id).await?;
        let after = self.snapshot(product_id).await?;
        if before == after {
            Ok((after, durable))
        } else {
            debug!(product_id, ?before, ?after, "Fast-path stock moved across the durable read");
            Err(ReconcileError::StockMoved { product_id })
        }
    }

    async fn snapshot(&self, product_id: i64) -> Result<StockSnapshot, ReconcileError> {
        self.fast
            .stock_snapshot(product_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("fast-path stock of product {product_id}")))
    }

    async fn durable_stock(&self, product_id: i64) -> Result<i64, ReconcileError> {
        self.inventory
            .store()
            .get_inventory(product_id)
            .await?
            .map(|record| record.stock)
            .ok_or_else(|| ReconcileError::NotFound(format!("inventory of product {product_id}")))
    }

    async fn pending_diff(&self, diff_id: i64) -> Result<InventoryDiff, ReconcileError> {
        let diff = self
            .inventory
            .store()
            .get_diff(diff_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("diff {diff_id}")))?;
        if diff.status == DiffStatus::Pending {
            Ok(diff)
        } else {
            Err(ReconcileError::NotPending(diff_id))
        }
    }

    /// Fix a pending drift record in an operator-chosen direction.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::NotFound`] or [`ReconcileError::NotPending`]
    /// for an unknown or resolved record, [`ReconcileError::LockBusy`] if the
    /// product lock could not be taken.
    pub async fn fix_diff(
        &self,
        diff_id: i64,
        fix_type: FixType,
        operator: &str,
        remark: &str,
    ) -> Result<(), ReconcileError> {
        let diff = self.pending_diff(diff_id).await?;
        self.apply_fix(diff.id, diff.product_id, fix_type, operator, remark)
            .await?;
        info!(diff_id, product_id = diff.product_id, fix_type = fix_type.as_str(), operator, "Inventory drift fixed manually");
        Ok(())
    }

    /// Dismiss a pending drift record without touching either side.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::NotFound`] or [`ReconcileError::NotPending`]
    /// for an unknown or resolved record.
    pub async fn ignore_diff(
        &self,
        diff_id: i64,
        operator: &str,
        remark: &str,
    ) -> Result<(), ReconcileError> {
        let diff = self.pending_diff(diff_id).await?;
        let resolved = self
            .inventory
            .store()
            .resolve_diff(diff.id, DiffStatus::Ignored, operator, remark, self.clock.now())
            .await?;
        if !resolved {
            return Err(ReconcileError::NotPending(diff_id));
        }
        info!(diff_id, product_id = diff.product_id, operator, "Inventory drift ignored");
        Ok(())
    }

    /// Pending drift records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] if the query failed.
    pub async fn pending_diffs(&self, limit: usize) -> Result<Vec<InventoryDiff>, ReconcileError> {
        Ok(self.inventory.store().pending_diffs(limit).await?)
    }

    /// Run a cycle now, outside the schedule.
    ///
    /// # Errors
    ///
    /// See [`InventoryReconciler::run_cycle`].
    pub async fn trigger_check(&self) -> Result<Vec<ProductHealth>, ReconcileError> {
        info!("Manual reconciliation triggered");
        self.run_cycle().await
    }

    /// Counters since start or the last reset.
    #[must_use]
    pub fn stats(&self) -> ReconcileStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Zero the counters.
    pub fn reset_stats(&self) {
        self.update_stats(|stats| *stats = ReconcileStats::default());
    }

    /// Run a cycle every interval until shutdown.
    #[must_use]
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.interval, "Inventory reconciler started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = self.run_cycle().await {
                            error!(error = %error, "Reconciliation cycle failed");
                        }
                    }
                }
            }
            info!("Inventory reconciler stopped");
        })
    }
}
