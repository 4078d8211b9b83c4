//! Lua scripts evaluated atomically by Redis.
//!
//! Each script runs to completion before any other command touches its keys,
//! which is what makes the purchase check-and-deduct sequence indivisible.

use redis::Script;

/// Atomic purchase.
///
/// - `KEYS[1]` stock, `KEYS[2]` buyer set, `KEYS[3]` activity,
///   `KEYS[4]` pending purchase record, `KEYS[5]` unsettled count
/// - `ARGV[1]` user id, `ARGV[2]` quantity, `ARGV[3]` now (epoch ms),
///   `ARGV[4]` product id, `ARGV[5]` record TTL in seconds
///
/// The unsettled count shares the record TTL, refreshed on every purchase, so
/// units of records that expire while pending age out with them.
///
/// Returns a negative code, or `{1, remaining_stock}`.
pub const PURCHASE: &str = r"
local quantity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

if quantity == nil or quantity <= 0 then
    return -7
end

local activity_json = redis.call('GET', KEYS[3])
if not activity_json then
    return -4
end

local activity = cjson.decode(activity_json)
if now < tonumber(activity.start_time) then
    return -5
end
if now >= tonumber(activity.end_time) then
    return -6
end

if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
    return -3
end

local stock = redis.call('GET', KEYS[1])
if not stock then
    return -1
end
stock = tonumber(stock)
if stock < quantity then
    return -2
end

local remaining = stock - quantity
redis.call('SET', KEYS[1], remaining, 'KEEPTTL')
redis.call('SADD', KEYS[2], ARGV[1])

local record = cjson.encode({
    user_id = tonumber(ARGV[1]),
    product_id = tonumber(ARGV[4]),
    quantity = quantity,
    purchase_time = now,
    status = 'pending'
})
redis.call('SET', KEYS[4], record, 'EX', tonumber(ARGV[5]))
redis.call('INCRBY', KEYS[5], quantity)
redis.call('EXPIRE', KEYS[5], tonumber(ARGV[5]))

return {1, remaining}
";

/// Rollback of a successful purchase.
///
/// - `KEYS[1]` stock, `KEYS[2]` buyer set, `KEYS[3]` purchase record,
///   `KEYS[4]` unsettled count
/// - `ARGV[1]` user id, `ARGV[2]` quantity
///
/// A missing stock key means the product was cleaned up or expired; it is
/// left absent rather than recreated without a TTL.
///
/// Returns the restored stock, or nil when the stock key is gone or the user
/// is not a buyer.
pub const ROLLBACK: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 0 then
    return false
end

local restored = redis.call('INCRBY', KEYS[1], tonumber(ARGV[2]))
redis.call('SREM', KEYS[2], ARGV[1])

local record_json = redis.call('GET', KEYS[3])
if record_json then
    local record = cjson.decode(record_json)
    if record.status == 'pending' then
        local left = redis.call('DECRBY', KEYS[4], tonumber(record.quantity))
        if left <= 0 then
            redis.call('DEL', KEYS[4])
        end
    end
    record.status = 'failed'
    redis.call('SET', KEYS[3], cjson.encode(record), 'KEEPTTL')
end

return restored
";

/// Status change of a purchase record.
///
/// - `KEYS[1]` purchase record, `KEYS[2]` unsettled count
/// - `ARGV[1]` new status
///
/// Leaving `pending` releases the record's units from the unsettled count.
/// Returns 0 when the record is gone, 1 otherwise.
pub const MARK_PURCHASE: &str = r"
local record_json = redis.call('GET', KEYS[1])
if not record_json then
    return 0
end

local record = cjson.decode(record_json)
local previous = record.status
record.status = ARGV[1]
redis.call('SET', KEYS[1], cjson.encode(record), 'KEEPTTL')

if previous == 'pending' and ARGV[1] ~= 'pending' then
    local left = redis.call('DECRBY', KEYS[2], tonumber(record.quantity))
    if left <= 0 then
        redis.call('DEL', KEYS[2])
    end
end
return 1
";

/// Stock and unsettled count read together: `{stock, unsettled}`, or nil
/// when the stock key is absent.
///
/// - `KEYS[1]` stock, `KEYS[2]` unsettled count
pub const SNAPSHOT: &str = r"
local stock = redis.call('GET', KEYS[1])
if not stock then
    return false
end

local unsettled = tonumber(redis.call('GET', KEYS[2]) or '0')
if unsettled < 0 then
    unsettled = 0
end
return {tonumber(stock), unsettled}
";

/// Compare-and-set on the stock counter, keeping its TTL.
///
/// - `KEYS[1]` stock
/// - `ARGV[1]` expected value, `ARGV[2]` new value
///
/// Returns 1 when written, 0 when the counter is absent or moved.
pub const CAS_STOCK: &str = r"
local current = redis.call('GET', KEYS[1])
if not current or tonumber(current) ~= tonumber(ARGV[1]) then
    return 0
end

redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
return 1
";

/// Buyer-set membership for every user id in `ARGV`, as 0/1 in input order.
pub const BATCH_CHECK: &str = r"
local result = {}
for i = 1, #ARGV do
    result[i] = redis.call('SISMEMBER', KEYS[1], ARGV[i])
end
return result
";

/// Product statistics: `{stock or 0, buyer count, activity json or ''}`.
pub const STATS: &str = r"
local stock = redis.call('GET', KEYS[1])
if not stock then
    stock = 0
else
    stock = tonumber(stock)
end

local buyers = redis.call('SCARD', KEYS[2])
local activity = redis.call('GET', KEYS[3])

return {stock, buyers, activity or ''}
";

/// Compare-and-delete on a lock key.
pub const LOCK_RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Compare-and-expire on a lock key. `ARGV[2]` is the TTL in milliseconds.
pub const LOCK_RENEW: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Loaded scripts, hashed once so calls go through `EVALSHA`.
#[derive(Clone)]
pub struct Scripts {
    pub(crate) purchase: Script,
    pub(crate) rollback: Script,
    pub(crate) mark_purchase: Script,
    pub(crate) snapshot: Script,
    pub(crate) cas_stock: Script,
    pub(crate) batch_check: Script,
    pub(crate) stats: Script,
    pub(crate) lock_release: Script,
    pub(crate) lock_renew: Script,
}

impl Scripts {
    /// Hash every script.
    #[must_use]
    pub fn new() -> Self {
        Self {
            purchase: Script::new(PURCHASE),
            rollback: Script::new(ROLLBACK),
            mark_purchase: Script::new(MARK_PURCHASE),
            snapshot: Script::new(SNAPSHOT),
            cas_stock: Script::new(CAS_STOCK),
            batch_check: Script::new(BATCH_CHECK),
            stats: Script::new(STATS),
            lock_release: Script::new(LOCK_RELEASE),
            lock_renew: Script::new(LOCK_RENEW),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripts")
            .field("purchase", &self.purchase.get_hash())
            .field("rollback", &self.rollback.get_hash())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_hash_distinctly() {
        let scripts = Scripts::new();
        let hashes = [
            scripts.purchase.get_hash(),
            scripts.rollback.get_hash(),
            scripts.mark_purchase.get_hash(),
            scripts.snapshot.get_hash(),
            scripts.cas_stock.get_hash(),
            scripts.batch_check.get_hash(),
            scripts.stats.get_hash(),
            scripts.lock_release.get_hash(),
            scripts.lock_renew.get_hash(),
        ];
        for (i, a) in hashes.iter().enumerate() {
            for b in &hashes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
