use poml_core::{CounterStore, PomlError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::debug;

/// Process-local counters.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counts: RwLock<HashMap<String, u32>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn get(&self, key: &str) -> Result<u32> {
        let counts = self
            .counts
            .read()
            .map_err(|_| PomlError::StorageError("counter lock poisoned".into()))?;
        Ok(counts.get(key).copied().unwrap_or(0))
    }

    fn set(&self, key: &str, value: u32) -> Result<()> {
        let mut counts = self
            .counts
            .write()
            .map_err(|_| PomlError::StorageError("counter lock poisoned".into()))?;
        counts.insert(key.to_string(), value);
        Ok(())
    }
}

/// Counters kept as a single JSON object on disk.
pub struct FileCounterStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FileCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        debug!("FileCounterStore initialized: path={:?}", path);
        Ok(Self {
            path,
            io_lock: Mutex::new(()),
        })
    }

    /// Default location under a data directory.
    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        Self::new(data_dir.join("quota.json"))
    }

    fn read_all(&self) -> Result<HashMap<String, u32>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let json = fs::read_to_string(&self.path)?;
        if json.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&json)?)
    }

    fn write_all(&self, counts: &HashMap<String, u32>) -> Result<()> {
        let json = serde_json::to_string_pretty(counts)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.io_lock
            .lock()
            .map_err(|_| PomlError::StorageError("counter file lock poisoned".into()))
    }
}

impl CounterStore for FileCounterStore {
    fn get(&self, key: &str) -> Result<u32> {
        let _guard = self.lock()?;
        Ok(self.read_all()?.get(key).copied().unwrap_or(0))
    }

    fn set(&self, key: &str, value: u32) -> Result<()> {
        let _guard = self.lock()?;
        let mut counts = self.read_all()?;
        counts.insert(key.to_string(), value);
        self.write_all(&counts)?;

        debug!("Stored counter {}={}", key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_defaults_to_zero() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.get("anonymous").unwrap(), 0);

        store.set("anonymous", 2).unwrap();
        assert_eq!(store.get("anonymous").unwrap(), 2);
        assert_eq!(store.get("user:u1").unwrap(), 0);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();

        let store = FileCounterStore::in_dir(temp_dir.path()).unwrap();
        assert_eq!(store.get("user:u1").unwrap(), 0);
        store.set("user:u1", 7).unwrap();
        store.set("anonymous", 1).unwrap();

        let reopened = FileCounterStore::in_dir(temp_dir.path()).unwrap();
        assert_eq!(reopened.get("user:u1").unwrap(), 7);
        assert_eq!(reopened.get("anonymous").unwrap(), 1);
        assert!(temp_dir.path().join("quota.json").exists());
    }
}
