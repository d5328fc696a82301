use super::{apply_ops, KeyValueStore, StoreError, WriteBatch};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Key/value store kept as a single JSON object on disk.
///
/// Reads are served from an in-memory cache. Every batch is written through
/// to a temporary sibling file which then replaces the real one, so a crash
/// mid-write leaves either the old or the new document, never a torn one.
#[derive(Debug)]
pub struct JsonFileStore {
    storage_path: PathBuf,
    cache: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// A document that does not parse as a JSON object is moved aside to
    /// `<file>.corrupt` and the store starts empty.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let storage_path = path.into();
        if let Some(parent) = storage_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = Self::load_from_disk(&storage_path)?;
        info!(path = %storage_path.display(), entries = entries.len(), "store opened");

        Ok(Self {
            storage_path,
            cache: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    fn load_from_disk(path: &Path) -> Result<BTreeMap<String, Value>, StoreError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                let aside = corrupt_path(path);
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "store document unreadable, starting empty"
                );
                fs::rename(path, &aside)?;
                Ok(BTreeMap::new())
            }
        }
    }

    fn save_to_disk(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.storage_path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.storage_path)?;
        debug!(path = %self.storage_path.display(), bytes = json.len(), "store flushed");
        Ok(())
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.cache.lock().get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        // the lock is held across the flush so writers are applied in order
        let mut cache = self.cache.lock();
        let mut next = cache.clone();
        apply_ops(&mut next, batch);
        self.save_to_disk(&next)?;
        *cache = next;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .cache
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store
                .write(WriteBatch::new().put("monitor.cancelled_count", 3).put("name", "x"))
                .unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("monitor.cancelled_count").unwrap(), Some(json!(3)));
        assert_eq!(store.get("name").unwrap(), Some(json!("x")));
    }

    #[test]
    fn test_corrupt_document_is_moved_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get("anything").unwrap().is_none());
        assert!(dir.path().join("state.json.corrupt").exists());

        store.put("k", json!(1)).unwrap();
        assert_eq!(JsonFileStore::open(&path).unwrap().get("k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("dedup.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.put("dedup/m1", json!(1)).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.write(WriteBatch::new().put("a", 1).put("b", 2)).unwrap();
        store.remove("a").unwrap();
        drop(store);

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert_eq!(store.scan_prefix("").unwrap().len(), 1);
    }
}
