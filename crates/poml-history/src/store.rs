use poml_config::HistorySettings;
use poml_core::{ConversionRecord, HistoryBackend, Identity, PomlError, RecordId, Result, Tier};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const DOCUMENT_EXTENSION: &str = "poml";

/// Append-only record of conversions, partitioned by identity.
pub struct HistoryStore {
    backend: Arc<dyn HistoryBackend>,
    record_anonymous: bool,
    free_visible_limit: Option<usize>,
}

impl HistoryStore {
    pub fn new(backend: Arc<dyn HistoryBackend>, settings: &HistorySettings) -> Self {
        Self {
            backend,
            record_anonymous: settings.record_anonymous,
            free_visible_limit: settings.free_visible_limit,
        }
    }

    /// Whether conversions of this identity are kept at all.
    pub fn retains(&self, identity: &Identity) -> bool {
        !identity.is_anonymous() || self.record_anonymous
    }

    pub fn append(&self, record: ConversionRecord) -> Result<RecordId> {
        let key = record.identity.partition_key();
        self.backend.insert(&key, &record)?;

        debug!(partition = %key, record_id = %record.id, "Conversion recorded");
        Ok(record.id)
    }

    /// A fresh snapshot of the partition, oldest first.
    pub fn list_for(&self, identity: &Identity) -> Result<Vec<ConversionRecord>> {
        self.backend.list_ordered(&identity.partition_key())
    }

    pub fn find(&self, identity: &Identity, id: RecordId) -> Result<ConversionRecord> {
        self.list_for(identity)?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| PomlError::NotFound(format!("conversion {id}")))
    }

    /// Read-side retention: non-Pro tiers only see their most recent records.
    pub fn visible_for(&self, identity: &Identity, tier: Tier) -> Result<Vec<ConversionRecord>> {
        let mut records = self.list_for(identity)?;

        if tier != Tier::Pro {
            if let Some(limit) = self.free_visible_limit {
                let hidden = records.len().saturating_sub(limit);
                records.drain(..hidden);
            }
        }
        Ok(records)
    }
}

/// Write a generated document as plain text with the `.poml` extension.
pub fn export_document(document: &str, path: &Path) -> Result<PathBuf> {
    let target = if path.extension().and_then(|e| e.to_str()) == Some(DOCUMENT_EXTENSION) {
        path.to_path_buf()
    } else {
        path.with_extension(DOCUMENT_EXTENSION)
    };

    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, document)?;

    info!("Exported document to {:?}", target);
    Ok(target)
}
