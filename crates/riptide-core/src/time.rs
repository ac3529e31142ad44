//! Wall-clock helpers.
//!
//! TTLs travel between stores as absolute unix timestamps in
//! milliseconds, so unlike a cache's internal expiry bookkeeping these
//! helpers use the system clock, not a monotonic one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Converts a relative PTTL reply into an absolute expiry.
///
/// `-1` (no expiry) and `-2` (no such key) both map to `None`; callers
/// distinguish missing keys through the TYPE reply.
#[inline]
pub fn absolute_expiry(pttl: i64, now: i64) -> Option<i64> {
    (pttl >= 0).then(|| now + pttl)
}

/// Absolute expiry `ttl` from now.
#[inline]
pub fn expiry_after(ttl: Duration) -> i64 {
    now_ms() + ttl.as_millis() as i64
}
