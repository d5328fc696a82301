//! Alert rate limiter: at most one alert per window.
//!
//! Stateless. The last alert time lives in the persisted monitor record.

use crate::models::EpochMillis;
use std::time::Duration;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(180_000);

fn window_ms(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

/// True when at least `window` has passed since `last_alert_at`.
/// A `last_alert_at` of 0 means no alert has fired yet.
pub fn should_alert(now: EpochMillis, last_alert_at: EpochMillis, window: Duration) -> bool {
    now.saturating_sub(last_alert_at) >= window_ms(window)
}

/// Milliseconds until the gate opens again, 0 if already open.
pub fn remaining_ms(now: EpochMillis, last_alert_at: EpochMillis, window: Duration) -> i64 {
    let elapsed = now.saturating_sub(last_alert_at);
    (window_ms(window) - elapsed).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: EpochMillis = 1_700_000_000_000;

    #[test]
    fn test_window_boundary() {
        assert!(!should_alert(T + 179_000, T, DEFAULT_COOLDOWN));
        assert!(!should_alert(T + 179_999, T, DEFAULT_COOLDOWN));
        assert!(should_alert(T + 180_000, T, DEFAULT_COOLDOWN));
    }

    #[test]
    fn test_first_alert_always_allowed() {
        assert!(should_alert(T, 0, DEFAULT_COOLDOWN));
    }

    #[test]
    fn test_remaining() {
        assert_eq!(remaining_ms(T + 179_000, T, DEFAULT_COOLDOWN), 1_000);
        assert_eq!(remaining_ms(T + 500_000, T, DEFAULT_COOLDOWN), 0);
    }

    #[test]
    fn test_clock_moved_backwards_keeps_gate_closed() {
        assert!(!should_alert(T - 5_000, T, DEFAULT_COOLDOWN));
        assert_eq!(remaining_ms(T - 5_000, T, DEFAULT_COOLDOWN), 185_000);
    }
}
