//! Purchase requests, outcomes and client-visible result codes.
//!
//! Three layers of result travel through the engine:
//!
//! - [`PurchaseOutcome`]: what the atomic purchase protocol decided. Every
//!   variant is a *business* outcome; store failures are `Err` instead.
//! - [`SeckillCode`]: the outcome plus the overload and system signals the
//!   coordinator adds (rate limited, circuit open, queue full, ...).
//! - [`SeckillResponse`]: the payload handed back to the caller.

use crate::activity::Activity;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound purchase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    /// Product being bought
    pub product_id: i64,
    /// Buyer
    pub user_id: i64,
    /// Units requested
    pub quantity: i64,
}

impl PurchaseRequest {
    /// Create a request.
    #[must_use]
    pub const fn new(product_id: i64, user_id: i64, quantity: i64) -> Self {
        Self {
            product_id,
            user_id,
            quantity,
        }
    }

    /// Whether every field is positive.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.product_id > 0 && self.user_id > 0 && self.quantity > 0
    }
}

/// Result of one run of the atomic purchase protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// Stock was deducted and the user recorded
    Success {
        /// Stock left after the deduction
        remaining_stock: i64,
    },
    /// No stock counter exists for the product
    StockNotFound,
    /// Fewer units left than requested
    InsufficientStock,
    /// The user already bought this product
    AlreadyBought,
    /// No activity is defined for the product
    ActivityNotFound,
    /// The activity window has not opened yet
    ActivityNotStarted,
    /// The activity window has closed
    ActivityEnded,
    /// Quantity was zero or negative
    InvalidQuantity,
}

impl PurchaseOutcome {
    /// Numeric code shared with the purchase script.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::Success { .. } => 1,
            Self::StockNotFound => -1,
            Self::InsufficientStock => -2,
            Self::AlreadyBought => -3,
            Self::ActivityNotFound => -4,
            Self::ActivityNotStarted => -5,
            Self::ActivityEnded => -6,
            Self::InvalidQuantity => -7,
        }
    }

    /// Decode a script reply.
    ///
    /// `remaining_stock` is only consulted for the success code.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Script`] for an unknown code, or a success code
    /// without a remaining-stock value.
    pub fn from_code(code: i64, remaining_stock: Option<i64>) -> Result<Self, StoreError> {
        match code {
            1 => remaining_stock
                .map(|remaining_stock| Self::Success { remaining_stock })
                .ok_or_else(|| StoreError::Script("success reply without remaining stock".into())),
            -1 => Ok(Self::StockNotFound),
            -2 => Ok(Self::InsufficientStock),
            -3 => Ok(Self::AlreadyBought),
            -4 => Ok(Self::ActivityNotFound),
            -5 => Ok(Self::ActivityNotStarted),
            -6 => Ok(Self::ActivityEnded),
            -7 => Ok(Self::InvalidQuantity),
            other => Err(StoreError::Script(format!("unknown purchase code {other}"))),
        }
    }

    /// Whether stock was deducted.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Client-visible result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeckillCode {
    /// Purchase succeeded
    Success,
    /// No stock counter for the product
    StockNotFound,
    /// Sold out or not enough units
    InsufficientStock,
    /// User already bought
    AlreadyBought,
    /// No activity for the product
    ActivityNotFound,
    /// Window not yet open
    ActivityNotStarted,
    /// Window closed
    ActivityEnded,
    /// Bad quantity or request fields
    InvalidQuantity,
    /// Infrastructure failure
    SystemError,
    /// Degraded mode or lock contention
    SystemBusy,
    /// Deadline passed before a result arrived
    RequestTimeout,
    /// Rejected by the rate limiter
    RateLimited,
    /// Rejected by the circuit breaker
    CircuitOpen,
    /// Request queue at capacity
    QueueFull,
}

impl SeckillCode {
    /// Numeric wire code.
    #[must_use]
    pub const fn as_i32(&self) -> i32 {
        match self {
            Self::Success => 1,
            Self::StockNotFound => -1,
            Self::InsufficientStock => -2,
            Self::AlreadyBought => -3,
            Self::ActivityNotFound => -4,
            Self::ActivityNotStarted => -5,
            Self::ActivityEnded => -6,
            Self::InvalidQuantity => -7,
            Self::SystemError => -8,
            Self::SystemBusy => -9,
            Self::RequestTimeout => -10,
            Self::RateLimited => -11,
            Self::CircuitOpen => -12,
            Self::QueueFull => -13,
        }
    }

    /// Inverse of [`SeckillCode::as_i32`].
    #[must_use]
    pub const fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::Success,
            -1 => Self::StockNotFound,
            -2 => Self::InsufficientStock,
            -3 => Self::AlreadyBought,
            -4 => Self::ActivityNotFound,
            -5 => Self::ActivityNotStarted,
            -6 => Self::ActivityEnded,
            -7 => Self::InvalidQuantity,
            -8 => Self::SystemError,
            -9 => Self::SystemBusy,
            -10 => Self::RequestTimeout,
            -11 => Self::RateLimited,
            -12 => Self::CircuitOpen,
            -13 => Self::QueueFull,
            _ => return None,
        })
    }

    /// Default human-readable message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::Success => "purchase succeeded",
            Self::StockNotFound => "stock not found",
            Self::InsufficientStock => "insufficient stock",
            Self::AlreadyBought => "already purchased",
            Self::ActivityNotFound => "activity not found",
            Self::ActivityNotStarted => "activity not started",
            Self::ActivityEnded => "activity ended",
            Self::InvalidQuantity => "invalid quantity",
            Self::SystemError => "system error",
            Self::SystemBusy => "system busy, please retry later",
            Self::RequestTimeout => "request timed out",
            Self::RateLimited => "too many requests, please retry later",
            Self::CircuitOpen => "service temporarily unavailable",
            Self::QueueFull => "request queue full, please retry later",
        }
    }

    /// Whether the client should back off and retry rather than treat the
    /// result as final.
    #[must_use]
    pub const fn is_overload(&self) -> bool {
        matches!(
            self,
            Self::SystemBusy | Self::RateLimited | Self::CircuitOpen | Self::QueueFull
        )
    }

    /// Whether this is a business-rule outcome rather than a system signal.
    #[must_use]
    pub const fn is_business(&self) -> bool {
        matches!(
            self,
            Self::StockNotFound
                | Self::InsufficientStock
                | Self::AlreadyBought
                | Self::ActivityNotFound
                | Self::ActivityNotStarted
                | Self::ActivityEnded
                | Self::InvalidQuantity
        )
    }

    /// Label used for the `outcome` metric dimension.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::StockNotFound => "stock_not_found",
            Self::InsufficientStock => "insufficient_stock",
            Self::AlreadyBought => "already_bought",
            Self::ActivityNotFound => "activity_not_found",
            Self::ActivityNotStarted => "activity_not_started",
            Self::ActivityEnded => "activity_ended",
            Self::InvalidQuantity => "invalid_quantity",
            Self::SystemError => "system_error",
            Self::SystemBusy => "system_busy",
            Self::RequestTimeout => "request_timeout",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::QueueFull => "queue_full",
        }
    }
}

impl From<PurchaseOutcome> for SeckillCode {
    fn from(outcome: PurchaseOutcome) -> Self {
        match outcome {
            PurchaseOutcome::Success { .. } => Self::Success,
            PurchaseOutcome::StockNotFound => Self::StockNotFound,
            PurchaseOutcome::InsufficientStock => Self::InsufficientStock,
            PurchaseOutcome::AlreadyBought => Self::AlreadyBought,
            PurchaseOutcome::ActivityNotFound => Self::ActivityNotFound,
            PurchaseOutcome::ActivityNotStarted => Self::ActivityNotStarted,
            PurchaseOutcome::ActivityEnded => Self::ActivityEnded,
            PurchaseOutcome::InvalidQuantity => Self::InvalidQuantity,
        }
    }
}

/// Response returned to a synchronous purchase caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillResponse {
    /// Numeric result code
    pub code: i32,
    /// Human-readable message
    pub message: String,
    /// Whether stock was secured
    pub success: bool,
    /// Stock left after a successful purchase, 0 otherwise
    pub remaining_stock: i64,
    /// Order id assigned to a successful purchase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

impl SeckillResponse {
    /// Failure response carrying the code's default message.
    #[must_use]
    pub fn rejected(code: SeckillCode) -> Self {
        Self {
            code: code.as_i32(),
            message: code.message().to_string(),
            success: false,
            remaining_stock: 0,
            order_id: None,
        }
    }

    /// Successful response.
    #[must_use]
    pub fn succeeded(remaining_stock: i64, order_id: String) -> Self {
        Self {
            code: SeckillCode::Success.as_i32(),
            message: SeckillCode::Success.message().to_string(),
            success: true,
            remaining_stock,
            order_id: Some(order_id),
        }
    }

    /// Replace the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Typed view of [`SeckillResponse::code`].
    #[must_use]
    pub const fn kind(&self) -> Option<SeckillCode> {
        SeckillCode::from_i32(self.code)
    }
}

/// Status of a pending purchase record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    /// Stock deducted, durable order not yet confirmed
    Pending,
    /// Durable order confirmed
    Success,
    /// Durable order abandoned and deduction rolled back
    Failed,
}

impl PurchaseStatus {
    /// Storage form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Short-lived per-user record written next to a successful deduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPurchase {
    /// Buyer
    pub user_id: i64,
    /// Product bought
    pub product_id: i64,
    /// Units deducted
    pub quantity: i64,
    /// When the deduction happened
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub purchase_time: DateTime<Utc>,
    /// Settlement status
    pub status: PurchaseStatus,
}

/// Stock counter read together with the units still awaiting settlement.
///
/// A unit is unsettled from the moment the purchase protocol deducts it until
/// its purchase record leaves [`PurchaseStatus::Pending`]. Durable stock only
/// reflects settled units, so `stock + unsettled` is what durable stock will
/// converge to once every in-flight order lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    /// Fast-path stock counter
    pub stock: i64,
    /// Units deducted but not yet settled
    pub unsettled: i64,
}

impl StockSnapshot {
    /// Stock the durable side should hold once pending purchases settle.
    #[must_use]
    pub const fn expected_durable(&self) -> i64 {
        self.stock + self.unsettled
    }
}

/// Fast-path view of one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStats {
    /// Product id
    pub product_id: i64,
    /// Current fast-path stock, 0 when missing
    pub current_stock: i64,
    /// Number of distinct buyers
    pub buyer_count: i64,
    /// Activity definition, if still present
    pub activity: Option<Activity>,
}
