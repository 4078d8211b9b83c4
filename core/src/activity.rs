//! Flash-sale activities.
//!
//! An [`Activity`] is one time-boxed offer for a product. It is written to the
//! fast store by an administrative preload and is read-only while the sale is
//! running. Times are serialized as epoch milliseconds so the purchase script
//! can compare them numerically against the caller's clock.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    /// Accepting purchases inside its window
    Active,
    /// Defined but switched off
    Inactive,
    /// Closed for good
    Ended,
}

impl ActivityStatus {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Ended => "ended",
        }
    }

    /// Parse the storage form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// One flash-sale offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Product on sale
    pub product_id: i64,
    /// Display name, copied onto orders
    pub product_name: String,
    /// Unit price
    pub price: f64,
    /// Initial stock
    pub stock: i64,
    /// First instant purchases are accepted (inclusive)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    /// First instant purchases are refused (exclusive)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end_time: DateTime<Utc>,
    /// Lifecycle status
    pub status: ActivityStatus,
}

impl Activity {
    /// Check the activity can be preloaded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for a non-positive product id, a
    /// negative stock, a negative price or an empty window.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.product_id <= 0 {
            return Err(StoreError::InvalidInput(format!(
                "product id must be positive, got {}",
                self.product_id
            )));
        }
        if self.stock < 0 {
            return Err(StoreError::InvalidInput(format!(
                "stock must not be negative, got {}",
                self.stock
            )));
        }
        if self.price < 0.0 {
            return Err(StoreError::InvalidInput("price must not be negative".into()));
        }
        if self.start_time >= self.end_time {
            return Err(StoreError::InvalidInput(
                "activity start must be before its end".into(),
            ));
        }
        Ok(())
    }

    /// Whether `now` falls inside `[start_time, end_time)`.
    #[must_use]
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time && now < self.end_time
    }
}
