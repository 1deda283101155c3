//! Queued item value type.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// A single queued message.
///
/// Items are immutable once enqueued, with one exception: `xid` is stamped at
/// the moment the item enters the open-transaction table of its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Enqueue time, epoch milliseconds.
    pub add_time: u64,
    /// Effective expiry, epoch milliseconds. `0` means the item never expires.
    pub expiry: u64,
    /// Payload bytes.
    pub data: Bytes,
    /// Transaction id for a tentatively-removed item. `0` means the item is
    /// not part of any open transaction.
    pub xid: u32,
}

impl Item {
    /// Creates a new item outside any transaction.
    #[must_use]
    pub fn new(add_time: u64, expiry: u64, data: Bytes) -> Self {
        Self {
            add_time,
            expiry,
            data,
            xid: 0,
        }
    }

    /// Logical size of the item in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns true if the item carries an expiry that has already passed.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiry > 0 && self.expiry < now_ms
    }

    /// Clamps a requested expiry to `add_time + max_age`.
    ///
    /// With `max_age == 0` the requested expiry passes through unchanged;
    /// otherwise a zero (never) expiry becomes `add_time + max_age` and a
    /// non-zero one is capped at it.
    #[must_use]
    pub fn adjust_expiry(add_time: u64, expiry: u64, max_age_ms: u64) -> u64 {
        if max_age_ms == 0 {
            return expiry;
        }
        let limit = add_time.saturating_add(max_age_ms);
        if expiry > 0 {
            expiry.min(limit)
        } else {
            limit
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
