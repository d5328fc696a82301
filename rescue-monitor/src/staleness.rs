//! Rejects events whose embedded timestamp is too old, mostly backlog the
//! broker redelivers right after a reconnect.

use crate::models::EpochMillis;
use std::time::Duration;

pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_millis(120_000);

/// Raw timestamps below this are read as seconds.
const SECONDS_CUTOFF: i64 = 10_000_000_000;

/// Publishers disagree on the unit, so small values are taken as seconds.
pub fn normalize_timestamp(raw: i64) -> EpochMillis {
    if raw < SECONDS_CUTOFF {
        raw.saturating_mul(1000)
    } else {
        raw
    }
}

/// Age of the event in milliseconds, negative when it is from the future.
pub fn age_ms(raw: i64, now: EpochMillis) -> i64 {
    now.saturating_sub(normalize_timestamp(raw))
}

/// An event without a timestamp is never stale, nor is one from the future.
pub fn is_stale(timestamp: Option<i64>, now: EpochMillis, threshold: Duration) -> bool {
    let Some(raw) = timestamp else {
        return false;
    };
    let threshold = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
    age_ms(raw, now) > threshold
}
