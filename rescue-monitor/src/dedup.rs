/**
 * DEDUP SET - message ids seen recently, with expiry
 *
 * ROLE :
 * Drops broker redeliveries of a message already processed. Membership
 * only; the first-seen time exists so entries can age out.
 *
 * HOW IT WORKS :
 * - Entries live under `dedup/<id>` in a `KeyValueStore` (survive restarts)
 * - An in-memory map mirrors the store for lock-cheap lookups
 * - `purge_expired` drops everything first seen more than `retention` ago
 * - `seen` then `mark_seen` is not atomic; the cooldown gate catches the
 *   rare double delivery racing through both
 */

use crate::models::EpochMillis;
use crate::storage::{KeyValueStore, StoreError, WriteBatch};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60 * 60);

const KEY_PREFIX: &str = "dedup/";

pub struct DedupSet {
    store: Arc<dyn KeyValueStore>,
    entries: Mutex<HashMap<String, EpochMillis>>,
}

impl DedupSet {
    /// Loads existing entries from `store`. Unreadable entries are removed.
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let mut entries = HashMap::new();
        let mut broken = WriteBatch::new();

        for (key, value) in store.scan_prefix(KEY_PREFIX)? {
            let id = &key[KEY_PREFIX.len()..];
            match value.as_i64() {
                Some(first_seen) if !id.is_empty() => {
                    entries.insert(id.to_string(), first_seen);
                }
                _ => {
                    warn!(key = %key, "dropping malformed dedup entry");
                    broken = broken.remove(key);
                }
            }
        }
        store.write(broken)?;

        info!(entries = entries.len(), "dedup set loaded");
        Ok(Self {
            store,
            entries: Mutex::new(entries),
        })
    }

    pub fn seen(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Records `id` as seen at `now`. Returns false if it was already known,
    /// in which case the original first-seen time is kept.
    pub fn mark_seen(&self, id: &str, now: EpochMillis) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return Ok(false);
        }
        self.store.put(&entry_key(id), Value::from(now))?;
        entries.insert(id.to_string(), now);
        Ok(true)
    }

    /// Removes entries first seen more than `retention` before `now`.
    pub fn purge_expired(&self, now: EpochMillis, retention: Duration) -> Result<usize, StoreError> {
        let retention = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention);

        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, first_seen)| **first_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            debug!(remaining = entries.len(), "dedup purge found nothing to remove");
            return Ok(0);
        }

        let batch = expired
            .iter()
            .fold(WriteBatch::new(), |batch, id| batch.remove(entry_key(id)));
        self.store.write(batch)?;
        for id in &expired {
            entries.remove(id);
        }

        info!(removed = expired.len(), remaining = entries.len(), "expired dedup entries purged");
        Ok(expired.len())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn entry_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}
