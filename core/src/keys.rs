//! Key derivation for the fast store.
//!
//! All per-product state lives under the `seckill:` namespace so a product can
//! be wiped with a handful of deletes and per-user purchase records can be
//! scanned by prefix.

/// Namespace shared by every fast-store key.
pub const NAMESPACE: &str = "seckill";

/// Lifetime of a per-user pending purchase record.
pub const PURCHASE_RECORD_TTL_SECS: u64 = 3600;

/// Integer stock counter for a product.
#[must_use]
pub fn stock_key(product_id: i64) -> String {
    format!("{NAMESPACE}:stock:{product_id}")
}

/// Set of user ids that already bought a product.
#[must_use]
pub fn buyers_key(product_id: i64) -> String {
    format!("{NAMESPACE}:users:{product_id}")
}

/// JSON-encoded activity definition.
#[must_use]
pub fn activity_key(product_id: i64) -> String {
    format!("{NAMESPACE}:activity:{product_id}")
}

/// Pending purchase record for one user of one product.
#[must_use]
pub fn purchase_key(product_id: i64, user_id: i64) -> String {
    format!("{NAMESPACE}:purchase:{product_id}:{user_id}")
}

/// Prefix matching every purchase record of a product.
#[must_use]
pub fn purchase_pattern(product_id: i64) -> String {
    format!("{NAMESPACE}:purchase:{product_id}:*")
}

/// Units deducted whose purchase records are still pending.
#[must_use]
pub fn unsettled_key(product_id: i64) -> String {
    format!("{NAMESPACE}:unsettled:{product_id}")
}

/// Distributed lock guarding multi-step operations on a product.
#[must_use]
pub fn lock_key(product_id: i64) -> String {
    format!("{NAMESPACE}:lock:{product_id}")
}
