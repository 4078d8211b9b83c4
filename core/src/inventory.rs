//! Durable inventory: versioned stock records, the operation log, drift
//! records and stock alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a durable inventory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryStatus {
    /// Sellable and audited by the reconciler
    Active,
    /// Not sellable
    Inactive,
    /// Frozen by an operator
    Locked,
}

impl InventoryStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Locked => "locked",
        }
    }

    /// Parse status from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "locked" => Some(Self::Locked),
            _ => None,
        }
    }
}

/// Authoritative per-product stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Product id
    pub product_id: i64,
    /// Display name
    pub product_name: String,
    /// Units on hand
    pub stock: i64,
    /// Units held for unsettled orders
    pub reserved: i64,
    /// `stock - reserved`
    pub available: i64,
    /// Incremented on every mutation
    pub version: i64,
    /// Record status
    pub status: InventoryStatus,
    /// Low-stock alert threshold
    pub min_stock: i64,
    /// Upper bound, 0 when unbounded
    pub max_stock: i64,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

/// Kind of a logged inventory mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryOperation {
    /// Record created
    Init,
    /// Stock decreased
    Deduct,
    /// Stock increased
    Add,
}

impl InventoryOperation {
    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Deduct => "deduct",
            Self::Add => "add",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Self::Init),
            "deduct" => Some(Self::Deduct),
            "add" => Some(Self::Add),
            _ => None,
        }
    }

    /// Operation implied by the sign of a delta.
    #[must_use]
    pub const fn for_delta(delta: i64) -> Self {
        if delta < 0 { Self::Deduct } else { Self::Add }
    }
}

/// Request to apply a signed delta to durable stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStockRequest {
    /// Product id
    pub product_id: i64,
    /// Negative for a sale, positive for restock or rollback
    pub delta: i64,
    /// Order the change settles; a second sync with the same id is a no-op
    pub order_id: Option<String>,
    /// Free-form reason, copied to the log
    pub reason: String,
    /// Correlates logs across services
    pub trace_id: String,
}

/// Result of an inventory sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStockResponse {
    /// Product id
    pub product_id: i64,
    /// Stock before the change
    pub before_stock: i64,
    /// Stock after the change
    pub after_stock: i64,
    /// Applied delta
    pub delta: i64,
    /// Whether the change was applied (or had already been applied)
    pub success: bool,
    /// Reason for a refusal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SyncStockResponse {
    /// A refused sync that left stock untouched.
    #[must_use]
    pub fn refused(product_id: i64, stock: i64, delta: i64, message: impl Into<String>) -> Self {
        Self {
            product_id,
            before_stock: stock,
            after_stock: stock,
            delta,
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Append-only log row for one durable stock mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLogEntry {
    /// Row id
    pub id: i64,
    /// Product id
    pub product_id: i64,
    /// Mutation kind
    pub operation: InventoryOperation,
    /// Signed change
    pub delta: i64,
    /// Stock before
    pub before_stock: i64,
    /// Stock after
    pub after_stock: i64,
    /// Settled order, if any
    pub order_id: Option<String>,
    /// Reason supplied by the caller
    pub reason: String,
    /// Who made the change
    pub operator: String,
    /// Correlates logs across services
    pub trace_id: String,
    /// When the change happened
    pub created_at: DateTime<Utc>,
}

/// Resolution status of a drift record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    /// Awaiting a fix
    Pending,
    /// Fixed automatically or by an operator
    Fixed,
    /// Dismissed by an operator
    Ignored,
}

impl DiffStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fixed => "fixed",
            Self::Ignored => "ignored",
        }
    }

    /// Parse status from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fixed" => Some(Self::Fixed),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }
}

/// Direction of a drift fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    /// Overwrite the fast-path counter with the durable stock
    UseDb,
    /// Apply the drift to durable stock through an inventory sync
    UseRedis,
}

impl FixType {
    /// Wire form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UseDb => "use_db",
            Self::UseRedis => "use_redis",
        }
    }

    /// Parse the wire form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "use_db" => Some(Self::UseDb),
            "use_redis" => Some(Self::UseRedis),
            _ => None,
        }
    }
}

/// Fields of a new drift record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewInventoryDiff {
    /// Product id
    pub product_id: i64,
    /// Durable stock at check time
    pub durable_stock: i64,
    /// Fast-path stock at check time
    pub fast_stock: i64,
}

impl NewInventoryDiff {
    /// `fast_stock - durable_stock`.
    #[must_use]
    pub const fn diff(&self) -> i64 {
        self.fast_stock - self.durable_stock
    }
}

/// A recorded disagreement between fast-path and durable stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDiff {
    /// Record id
    pub id: i64,
    /// Product id
    pub product_id: i64,
    /// Durable stock at check time
    pub durable_stock: i64,
    /// Fast-path stock at check time
    pub fast_stock: i64,
    /// `fast_stock - durable_stock`
    pub diff: i64,
    /// Resolution status
    pub status: DiffStatus,
    /// When it was resolved
    pub fixed_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub fixed_by: Option<String>,
    /// Operator or system note
    pub remark: Option<String>,
    /// When it was detected
    pub created_at: DateTime<Utc>,
}

/// Kind of an inventory alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Stock at or below the record's minimum
    LowStock,
    /// Stock exhausted
    OutOfStock,
    /// Drift beyond the alert threshold
    DiffAlert,
}

impl AlertKind {
    /// Wire form, also the metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LowStock => "low_stock",
            Self::OutOfStock => "out_of_stock",
            Self::DiffAlert => "diff_alert",
        }
    }
}

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational
    Info,
    /// Needs attention
    Warning,
    /// Needs action
    Error,
}

impl AlertLevel {
    /// Wire form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// An alert raised by inventory sync or reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAlert {
    /// Product id
    pub product_id: i64,
    /// Alert kind
    pub kind: AlertKind,
    /// Severity
    pub level: AlertLevel,
    /// Human-readable description
    pub message: String,
}

impl InventoryAlert {
    /// Stock alert implied by a post-sync stock level, if any.
    #[must_use]
    pub fn for_stock_level(product_id: i64, stock: i64, min_stock: i64) -> Option<Self> {
        if stock <= 0 {
            Some(Self {
                product_id,
                kind: AlertKind::OutOfStock,
                level: AlertLevel::Error,
                message: format!("product {product_id} is out of stock"),
            })
        } else if stock <= min_stock {
            Some(Self {
                product_id,
                kind: AlertKind::LowStock,
                level: AlertLevel::Warning,
                message: format!("product {product_id} stock {stock} at or below minimum {min_stock}"),
            })
        } else {
            None
        }
    }
}
