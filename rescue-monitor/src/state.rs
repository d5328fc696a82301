/**
 * MONITOR STATE - persisted record of an active monitoring session
 *
 * ROLE :
 * Single source of truth for "is monitoring on". The record exists only
 * while monitoring is active; nothing else (no flag, no cached copy) is
 * trusted for that question.
 *
 * HOW IT WORKS :
 * - One record spread over `monitor.*` keys of a `KeyValueStore`
 * - `activate` writes it whole, `deactivate` removes it whole (one batch each)
 * - Counters are read-increment-write under one writer lock, so the
 *   receive path and the loop never lose an increment to each other
 * - A record that fails to decode is logged, cleared and reported inactive
 * - Mutations on an absent record are dropped, never recreate it
 */

use crate::clock::Clock;
use crate::cooldown;
use crate::models::{ChannelConfig, EpochMillis, Location, MonitorState, MonitorStatus};
use crate::storage::{KeyValueStore, StoreError, WriteBatch};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const KEY_LOCATION: &str = "monitor.location";
const KEY_CHANNEL_CONFIG: &str = "monitor.channel_config";
const KEY_STARTED_AT: &str = "monitor.started_at";
const KEY_CANCELLED_COUNT: &str = "monitor.cancelled_count";
const KEY_CLAIMED_COUNT: &str = "monitor.claimed_count";
const KEY_RECONNECT_COUNT: &str = "monitor.reconnect_count";
const KEY_LAST_ALERT_AT: &str = "monitor.last_alert_at";

const ALL_KEYS: [&str; 7] = [
    KEY_LOCATION,
    KEY_CHANNEL_CONFIG,
    KEY_STARTED_AT,
    KEY_CANCELLED_COUNT,
    KEY_CLAIMED_COUNT,
    KEY_RECONNECT_COUNT,
    KEY_LAST_ALERT_AT,
];

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("channel configuration missing or unusable: {0}")]
    ConfigurationMissing(String),
    #[error("state store failure: {0}")]
    Store(#[from] StoreError),
    #[error("state encoding failure: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Cancelled,
    Claimed,
    Reconnect,
}

impl Counter {
    fn key(self) -> &'static str {
        match self {
            Counter::Cancelled => KEY_CANCELLED_COUNT,
            Counter::Claimed => KEY_CLAIMED_COUNT,
            Counter::Reconnect => KEY_RECONNECT_COUNT,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Counter::Cancelled => "cancelled",
            Counter::Claimed => "claimed",
            Counter::Reconnect => "reconnect",
        }
    }
}

/// Result of asking the cooldown gate for permission to alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertClaim {
    /// Gate passed; `last_alert_at` now holds the claim time.
    Fire {
        previous: EpochMillis,
        location: Location,
    },
    Suppressed { remaining_ms: i64 },
    Inactive,
}

enum Record {
    Absent,
    Valid(MonitorState),
    Corrupt(String),
}

pub struct MonitorStateStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl MonitorStateStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Starts (or restarts) monitoring with fresh counters.
    pub fn activate(
        &self,
        location: Location,
        channel_config: ChannelConfig,
    ) -> Result<MonitorState, StateError> {
        channel_config
            .validate()
            .map_err(StateError::ConfigurationMissing)?;

        let state = MonitorState {
            location,
            channel_config,
            started_at: self.clock.now_ms(),
            cancelled_count: 0,
            claimed_count: 0,
            reconnect_count: 0,
            last_alert_at: 0,
        };

        let batch = WriteBatch::new()
            .put(KEY_LOCATION, serde_json::to_value(&state.location)?)
            .put(KEY_CHANNEL_CONFIG, serde_json::to_value(&state.channel_config)?)
            .put(KEY_STARTED_AT, state.started_at)
            .put(KEY_CANCELLED_COUNT, 0u64)
            .put(KEY_CLAIMED_COUNT, 0u64)
            .put(KEY_RECONNECT_COUNT, 0u64)
            .put(KEY_LAST_ALERT_AT, 0i64);

        {
            let _guard = self.write_lock.lock();
            self.store.write(batch)?;
        }

        info!(
            location = %state.location.name,
            started_at = state.started_at,
            "monitoring activated, counters reset"
        );
        Ok(state)
    }

    /// Removes the whole record. Idempotent.
    pub fn deactivate(&self) -> Result<(), StateError> {
        let _guard = self.write_lock.lock();
        self.clear_locked()?;
        info!("monitoring deactivated, state cleared");
        Ok(())
    }

    /// Current status. A corrupt record is cleared and reported as inactive.
    pub fn read(&self) -> Result<MonitorStatus, StateError> {
        let _guard = self.write_lock.lock();
        Ok(match self.load_locked()? {
            Some(state) => MonitorStatus::Active(state),
            None => MonitorStatus::Inactive,
        })
    }

    pub fn current(&self) -> Result<Option<MonitorState>, StateError> {
        Ok(self.read()?.into_state())
    }

    pub fn is_active(&self) -> bool {
        match self.read() {
            Ok(status) => status.is_active(),
            Err(e) => {
                error!(error = %e, "failed to read monitor state");
                false
            }
        }
    }

    pub fn increment_cancelled(&self) -> Result<Option<u64>, StateError> {
        self.increment(Counter::Cancelled)
    }

    pub fn increment_claimed(&self) -> Result<Option<u64>, StateError> {
        self.increment(Counter::Claimed)
    }

    pub fn increment_reconnect(&self) -> Result<Option<u64>, StateError> {
        self.increment(Counter::Reconnect)
    }

    /// Adds one to `counter` and returns the new value, or `None` when
    /// monitoring is not active.
    pub fn increment(&self, counter: Counter) -> Result<Option<u64>, StateError> {
        let _guard = self.write_lock.lock();
        let Some(state) = self.load_locked()? else {
            debug!(counter = counter.label(), "monitoring inactive, increment dropped");
            return Ok(None);
        };

        let current = match counter {
            Counter::Cancelled => state.cancelled_count,
            Counter::Claimed => state.claimed_count,
            Counter::Reconnect => state.reconnect_count,
        };
        let next = current.saturating_add(1);
        self.store.put(counter.key(), Value::from(next))?;

        info!(counter = counter.label(), from = current, to = next, "counter incremented");
        Ok(Some(next))
    }

    /// Stores `timestamp` as the last alert time. Returns false when inactive.
    pub fn record_alert(&self, timestamp: EpochMillis) -> Result<bool, StateError> {
        let _guard = self.write_lock.lock();
        if self.load_locked()?.is_none() {
            return Ok(false);
        }
        self.store.put(KEY_LAST_ALERT_AT, Value::from(timestamp))?;
        debug!(timestamp, "last alert time saved");
        Ok(true)
    }

    /// Cooldown check and alert bookkeeping in one critical section, so two
    /// concurrent cancelled events can never both pass the gate.
    pub fn try_claim_alert(
        &self,
        now: EpochMillis,
        window: Duration,
    ) -> Result<AlertClaim, StateError> {
        let _guard = self.write_lock.lock();
        let Some(state) = self.load_locked()? else {
            return Ok(AlertClaim::Inactive);
        };

        if !cooldown::should_alert(now, state.last_alert_at, window) {
            return Ok(AlertClaim::Suppressed {
                remaining_ms: cooldown::remaining_ms(now, state.last_alert_at, window),
            });
        }

        self.store.put(KEY_LAST_ALERT_AT, Value::from(now))?;
        Ok(AlertClaim::Fire {
            previous: state.last_alert_at,
            location: state.location,
        })
    }

    fn clear_locked(&self) -> Result<(), StoreError> {
        let batch = ALL_KEYS
            .iter()
            .fold(WriteBatch::new(), |batch, key| batch.remove(*key));
        self.store.write(batch)
    }

    fn load_locked(&self) -> Result<Option<MonitorState>, StoreError> {
        match self.fetch_locked()? {
            Record::Absent => Ok(None),
            Record::Valid(state) => Ok(Some(state)),
            Record::Corrupt(reason) => {
                warn!(reason = %reason, "monitor state unreadable, clearing it");
                self.clear_locked()?;
                Ok(None)
            }
        }
    }

    fn fetch_locked(&self) -> Result<Record, StoreError> {
        let location = self.store.get(KEY_LOCATION)?;
        let channel_config = self.store.get(KEY_CHANNEL_CONFIG)?;

        let (location, channel_config) = match (location, channel_config) {
            (None, None) => return Ok(Record::Absent),
            (Some(l), Some(c)) => (l, c),
            (Some(_), None) => return Ok(Record::Corrupt("channel config missing".into())),
            (None, Some(_)) => return Ok(Record::Corrupt("location missing".into())),
        };

        let location: Location = match serde_json::from_value(location) {
            Ok(l) => l,
            Err(e) => return Ok(Record::Corrupt(format!("location: {e}"))),
        };
        let channel_config: ChannelConfig = match serde_json::from_value(channel_config) {
            Ok(c) => c,
            Err(e) => return Ok(Record::Corrupt(format!("channel config: {e}"))),
        };

        let started_at = match timestamp_field(self.store.get(KEY_STARTED_AT)?) {
            Ok(v) => v,
            Err(e) => return Ok(Record::Corrupt(format!("{KEY_STARTED_AT}: {e}"))),
        };
        let last_alert_at = match timestamp_field(self.store.get(KEY_LAST_ALERT_AT)?) {
            Ok(v) => v,
            Err(e) => return Ok(Record::Corrupt(format!("{KEY_LAST_ALERT_AT}: {e}"))),
        };

        let mut counts = [0u64; 3];
        for (slot, counter) in counts
            .iter_mut()
            .zip([Counter::Cancelled, Counter::Claimed, Counter::Reconnect])
        {
            match counter_field(self.store.get(counter.key())?) {
                Ok(v) => *slot = v,
                Err(e) => return Ok(Record::Corrupt(format!("{}: {e}", counter.key()))),
            }
        }

        Ok(Record::Valid(MonitorState {
            location,
            channel_config,
            started_at,
            cancelled_count: counts[0],
            claimed_count: counts[1],
            reconnect_count: counts[2],
            last_alert_at,
        }))
    }
}

fn counter_field(value: Option<Value>) -> Result<u64, &'static str> {
    match value {
        None => Ok(0),
        Some(v) => v.as_u64().ok_or("not a non-negative integer"),
    }
}

fn timestamp_field(value: Option<Value>) -> Result<EpochMillis, &'static str> {
    match value {
        None => Ok(0),
        Some(v) => v.as_i64().ok_or("not an integer timestamp"),
    }
}
