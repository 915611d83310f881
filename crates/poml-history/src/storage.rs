use poml_core::{ConversionRecord, HistoryBackend, PomlError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::debug;

/// Process-local history partitions.
#[derive(Debug, Default)]
pub struct MemoryHistoryBackend {
    partitions: RwLock<HashMap<String, Vec<ConversionRecord>>>,
}

impl MemoryHistoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryBackend for MemoryHistoryBackend {
    fn insert(&self, key: &str, record: &ConversionRecord) -> Result<()> {
        let mut partitions = self
            .partitions
            .write()
            .map_err(|_| PomlError::StorageError("history lock poisoned".into()))?;
        partitions
            .entry(key.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn list_ordered(&self, key: &str) -> Result<Vec<ConversionRecord>> {
        let partitions = self
            .partitions
            .read()
            .map_err(|_| PomlError::StorageError("history lock poisoned".into()))?;
        let mut records = partitions.get(key).cloned().unwrap_or_default();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

/// One JSONL file per partition under a history directory.
pub struct FileHistoryBackend {
    base_dir: PathBuf,
    io_lock: Mutex<()>,
}

impl FileHistoryBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        debug!("FileHistoryBackend initialized: base_dir={:?}", base_dir);
        Ok(Self {
            base_dir,
            io_lock: Mutex::new(()),
        })
    }

    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        Self::new(data_dir.join("history"))
    }

    /// Hash prefix keeps names unique, the sanitized suffix keeps them readable.
    fn partition_file_name(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let safe_name = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(40)
            .collect::<String>();

        format!("{}-{}.jsonl", &hash[..12], safe_name)
    }

    pub fn partition_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(Self::partition_file_name(key))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.io_lock
            .lock()
            .map_err(|_| PomlError::StorageError("history file lock poisoned".into()))
    }
}

impl HistoryBackend for FileHistoryBackend {
    fn insert(&self, key: &str, record: &ConversionRecord) -> Result<()> {
        let _guard = self.lock()?;
        let path = self.partition_path(key);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;

        debug!("Appended record {} to {:?}", record.id, path);
        Ok(())
    }

    fn list_ordered(&self, key: &str) -> Result<Vec<ConversionRecord>> {
        let _guard = self.lock()?;
        let path = self.partition_path(key);

        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let mut records = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                let record: ConversionRecord = serde_json::from_str(&line)?;
                records.push(record);
            }
        }

        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
