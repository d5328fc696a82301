/**
 * STORAGE - durable key/value backends for the monitor
 *
 * ROLE :
 * Both the persisted monitoring record and the dedup set sit on top of a
 * `KeyValueStore`. Values are JSON (strings, integers, objects).
 *
 * HOW IT WORKS :
 * - `KeyValueStore` = get / atomic batch write / prefix scan
 * - `WriteBatch`    = ordered puts and removes applied all-or-nothing
 * - `JsonFileStore` = one JSON document on disk, write-through cache
 * - `MemoryStore`   = same contract, nothing on disk (tests, dry runs)
 */

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(String, Value),
    Remove(String),
}

/// Ordered set of mutations applied atomically by [`KeyValueStore::write`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(WriteOp::Put(key.into(), value.into()));
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Remove(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Durable key/value store shared by the state record and the dedup set.
/// Implementations must make `write` all-or-nothing and survive restarts
/// (except [`MemoryStore`], which only promises the former).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;

    fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.write(WriteBatch::new().put(key, value))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.write(WriteBatch::new().remove(key))
    }
}

/// Applies a batch to an in-memory map. Shared by both backends.
pub(crate) fn apply_ops(map: &mut std::collections::BTreeMap<String, Value>, batch: WriteBatch) {
    for op in batch.into_ops() {
        match op {
            WriteOp::Put(key, value) => {
                map.insert(key, value);
            }
            WriteOp::Remove(key) => {
                map.remove(&key);
            }
        }
    }
}
