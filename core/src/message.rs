//! Messages emitted by the coordinator and consumed by the compensator.
//!
//! Both message kinds are JSON documents wrapped in an [`Envelope`] whose key
//! is the product id, so every message for a product lands on the same
//! partition of the transport.

use crate::message_bus::MessageBusError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message type tag of [`OrderCreatedMessage`].
pub const ORDER_MESSAGE_TYPE: &str = "seckill_order";

/// Message type tag of [`StockUpdateMessage`].
pub const STOCK_MESSAGE_TYPE: &str = "stock_update";

/// Default topic carrying order-creation messages.
pub const DEFAULT_ORDER_TOPIC: &str = "seckill-orders";

/// Default topic carrying stock-update messages.
pub const DEFAULT_STOCK_TOPIC: &str = "seckill-stock";

/// Transport-level wrapper around a serialized message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type tag, one of [`ORDER_MESSAGE_TYPE`] or [`STOCK_MESSAGE_TYPE`]
    pub message_type: String,
    /// Partition key
    pub key: String,
    /// JSON body
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Decode the payload according to the type tag.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::DeserializationFailed`] for an unknown type
    /// tag or a malformed body.
    pub fn decode(&self) -> Result<InboundMessage, MessageBusError> {
        match self.message_type.as_str() {
            ORDER_MESSAGE_TYPE => serde_json::from_slice(&self.payload)
                .map(InboundMessage::Order)
                .map_err(|e| MessageBusError::DeserializationFailed(e.to_string())),
            STOCK_MESSAGE_TYPE => serde_json::from_slice(&self.payload)
                .map(InboundMessage::StockUpdate)
                .map_err(|e| MessageBusError::DeserializationFailed(e.to_string())),
            other => Err(MessageBusError::DeserializationFailed(format!(
                "unknown message type '{other}'"
            ))),
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A purchase to settle durably
    Order(OrderCreatedMessage),
    /// A fast-path stock change
    StockUpdate(StockUpdateMessage),
}

/// Emitted after a successful fast-path purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedMessage {
    /// Order id assigned by the coordinator
    pub order_id: String,
    /// Product bought
    pub product_id: i64,
    /// Buyer
    pub user_id: i64,
    /// Units bought
    pub quantity: i64,
    /// Unit price at purchase time
    pub price: f64,
    /// When the purchase was accepted
    pub create_time: DateTime<Utc>,
    /// Always [`ORDER_MESSAGE_TYPE`]
    pub message_type: String,
    /// Correlates logs across services
    pub trace_id: String,
}

impl OrderCreatedMessage {
    /// Build an order message stamped at `create_time`.
    #[must_use]
    pub fn new(
        order_id: String,
        product_id: i64,
        user_id: i64,
        quantity: i64,
        price: f64,
        create_time: DateTime<Utc>,
        trace_id: String,
    ) -> Self {
        Self {
            order_id,
            product_id,
            user_id,
            quantity,
            price,
            create_time,
            message_type: ORDER_MESSAGE_TYPE.to_string(),
            trace_id,
        }
    }

    /// Wrap into an envelope keyed by product.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::Other`] if JSON encoding fails.
    pub fn to_envelope(&self) -> Result<Envelope, MessageBusError> {
        let payload = serde_json::to_vec(self).map_err(|e| MessageBusError::Other(e.to_string()))?;
        Ok(Envelope {
            message_type: ORDER_MESSAGE_TYPE.to_string(),
            key: self.product_id.to_string(),
            payload,
        })
    }
}

/// Emitted after every fast-path stock change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockUpdateMessage {
    /// Product id
    pub product_id: i64,
    /// Fast-path stock after the change
    pub remaining_stock: i64,
    /// When the change happened
    pub update_time: DateTime<Utc>,
    /// Always [`STOCK_MESSAGE_TYPE`]
    pub message_type: String,
    /// Correlates logs across services
    pub trace_id: String,
}

impl StockUpdateMessage {
    /// Build a stock message stamped at `update_time`.
    #[must_use]
    pub fn new(
        product_id: i64,
        remaining_stock: i64,
        update_time: DateTime<Utc>,
        trace_id: String,
    ) -> Self {
        Self {
            product_id,
            remaining_stock,
            update_time,
            message_type: STOCK_MESSAGE_TYPE.to_string(),
            trace_id,
        }
    }

    /// Wrap into an envelope keyed by product.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::Other`] if JSON encoding fails.
    pub fn to_envelope(&self) -> Result<Envelope, MessageBusError> {
        let payload = serde_json::to_vec(self).map_err(|e| MessageBusError::Other(e.to_string()))?;
        Ok(Envelope {
            message_type: STOCK_MESSAGE_TYPE.to_string(),
            key: self.product_id.to_string(),
            payload,
        })
    }
}
