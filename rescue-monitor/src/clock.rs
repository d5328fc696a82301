use crate::models::EpochMillis;
use time::OffsetDateTime;

/// Source of wall-clock time, in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> EpochMillis;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> EpochMillis {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as EpochMillis
    }
}
