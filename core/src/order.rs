//! Durable orders, idempotency and order-failure records.

use crate::message::OrderCreatedMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order type tag for flash-sale orders.
pub const ORDER_TYPE_SECKILL: &str = "seckill";

/// Failure type recorded when the durable order transaction fails.
pub const FAILURE_TYPE_ORDER_CREATION: &str = "order_creation";

/// Failure type recorded when the durable inventory settlement fails.
pub const FAILURE_TYPE_INVENTORY_SYNC: &str = "inventory_sync";

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Awaiting payment
    Pending,
    /// Paid
    Paid,
    /// Cancelled by the user
    Cancelled,
    /// Payment window elapsed
    Expired,
    /// Refunded
    Refunded,
}

impl OrderStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Refunded => "refunded",
        }
    }

    /// Parse status from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

/// Request to create one durable order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Order id assigned by the coordinator
    pub order_id: String,
    /// Buyer
    pub user_id: i64,
    /// Product bought
    pub product_id: i64,
    /// Display name copied onto the order
    pub product_name: String,
    /// Units bought
    pub quantity: i64,
    /// Unit price
    pub price: f64,
    /// Order type tag
    pub order_type: String,
    /// Correlates logs across services
    pub trace_id: String,
}

impl CreateOrderRequest {
    /// Build a request from an order-creation message.
    #[must_use]
    pub fn from_message(message: &OrderCreatedMessage) -> Self {
        Self {
            order_id: message.order_id.clone(),
            user_id: message.user_id,
            product_id: message.product_id,
            product_name: format!("Seckill product {}", message.product_id),
            quantity: message.quantity,
            price: message.price,
            order_type: ORDER_TYPE_SECKILL.to_string(),
            trace_id: message.trace_id.clone(),
        }
    }

    /// Check the request before opening a transaction.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.order_id.is_empty() {
            return Err("order id is empty".into());
        }
        if self.user_id <= 0 || self.product_id <= 0 {
            return Err("user and product ids must be positive".into());
        }
        if self.quantity <= 0 {
            return Err(format!("quantity must be positive, got {}", self.quantity));
        }
        if self.price < 0.0 {
            return Err("price must not be negative".into());
        }
        Ok(())
    }

    /// Price times quantity.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn total_amount(&self) -> f64 {
        self.price * self.quantity as f64
    }
}

/// A durable order row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order id
    pub order_id: String,
    /// Buyer
    pub user_id: i64,
    /// Product bought
    pub product_id: i64,
    /// Display name
    pub product_name: String,
    /// Units bought
    pub quantity: i64,
    /// Unit price
    pub price: f64,
    /// Price times quantity
    pub total_amount: f64,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Order type tag
    pub order_type: String,
    /// Correlates logs across services
    pub trace_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When an unpaid order lapses
    pub expired_at: Option<DateTime<Utc>>,
}

/// Result of an idempotent order creation.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOrderOutcome {
    /// A new order, line item and idempotency row were written
    Created(Order),
    /// The (user, product) pair already has an order; nothing was written
    Duplicate {
        /// Order id held by the existing idempotency row
        existing_order_id: String,
    },
}

impl CreateOrderOutcome {
    /// Order id of the created or pre-existing order.
    #[must_use]
    pub fn order_id(&self) -> &str {
        match self {
            Self::Created(order) => &order.order_id,
            Self::Duplicate { existing_order_id } => existing_order_id,
        }
    }
}

/// Status of an order failure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatus {
    /// Waiting for its next retry
    Pending,
    /// A retry is in flight
    Processing,
    /// Retries exhausted
    Failed,
    /// A retry succeeded
    Success,
    /// Aged out before settling
    Expired,
}

impl FailureStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Success => "success",
            Self::Expired => "expired",
        }
    }

    /// Parse status from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "failed" => Some(Self::Failed),
            "success" => Some(Self::Success),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether the record will not be retried again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Success | Self::Expired)
    }
}

/// Fields of a new failure record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderFailure {
    /// Order the failure belongs to
    pub order_id: String,
    /// Buyer
    pub user_id: i64,
    /// Product
    pub product_id: i64,
    /// One of the `FAILURE_TYPE_*` constants
    pub failure_type: String,
    /// Original message payload, replayed on retry
    pub message_data: String,
    /// Error text of the failed attempt
    pub error_msg: String,
    /// Retry ceiling
    pub max_retries: u32,
    /// When the first retry is due
    pub next_retry_at: DateTime<Utc>,
}

/// A persisted, retryable failure of a durable write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFailure {
    /// Record id
    pub id: i64,
    /// Order the failure belongs to
    pub order_id: String,
    /// Buyer
    pub user_id: i64,
    /// Product
    pub product_id: i64,
    /// One of the `FAILURE_TYPE_*` constants
    pub failure_type: String,
    /// Original message payload
    pub message_data: String,
    /// Error text of the latest failed attempt
    pub error_msg: String,
    /// Retries performed so far
    pub retry_count: u32,
    /// Retry ceiling
    pub max_retries: u32,
    /// When the next retry is due
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Record status
    pub status: FailureStatus,
    /// When the failure was first recorded
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl OrderFailure {
    /// Whether the scheduler should pick this record up at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>, created_after: DateTime<Utc>) -> bool {
        self.status == FailureStatus::Pending
            && self.retry_count < self.max_retries
            && self.created_at > created_after
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}
