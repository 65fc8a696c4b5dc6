//! View checkpoints: one MessagePack file per view holding the ordered
//! entries together with the watermark they reflect.

use super::index::ViewIndex;
use super::tree::EntryKey;
use crate::core::{ChangeSeq, IndexError, Result, Value};
use crate::reduce::{Combiner, ReduceSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const CHECKPOINT_EXTENSION: &str = "view";

// ============================================================================
// Checkpoint Image
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ViewCheckpoint {
    pub format_version: u32,
    pub view_id: String,
    /// `ReduceSpec::fingerprint` of the view that wrote it.
    pub reduce: String,
    pub watermark: ChangeSeq,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<(EntryKey, Value)>,
}

/// Everything but the entries.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointHeader {
    pub format_version: u32,
    pub view_id: String,
    pub reduce: String,
    pub watermark: ChangeSeq,
    pub created_at: DateTime<Utc>,
    pub entries: usize,
}

impl ViewCheckpoint {
    pub fn capture(view_id: &str, reduce: &ReduceSpec, index: &ViewIndex) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            view_id: view_id.to_string(),
            reduce: reduce.fingerprint(),
            watermark: index.watermark(),
            created_at: Utc::now(),
            entries: index
                .tree()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn header(&self) -> CheckpointHeader {
        CheckpointHeader {
            format_version: self.format_version,
            view_id: self.view_id.clone(),
            reduce: self.reduce.clone(),
            watermark: self.watermark,
            created_at: self.created_at,
            entries: self.entries.len(),
        }
    }

    /// Whether this checkpoint can seed the given view definition.
    pub fn matches(&self, view_id: &str, reduce: &ReduceSpec) -> bool {
        self.format_version == CHECKPOINT_FORMAT_VERSION
            && self.view_id == view_id
            && self.reduce == reduce.fingerprint()
    }

    pub fn into_index(
        self,
        combiner: Option<Arc<dyn Combiner>>,
    ) -> std::result::Result<ViewIndex, String> {
        ViewIndex::from_entries(self.entries, combiner, self.watermark)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| {
            IndexError::Serialization(format!("Failed to serialize checkpoint: {}", e))
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| {
            IndexError::Serialization(format!("Failed to deserialize checkpoint: {}", e))
        })
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            IndexError::Io(format!("Failed to read checkpoint {}: {}", path.display(), e))
        })?;
        Self::decode(&data)
    }
}

// ============================================================================
// Checkpoint Store
// ============================================================================

/// Directory of view checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `sample/not_done` is stored as `sample~not_done.view`.
    pub fn path_for(&self, view_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", view_id.replace('/', "~"), CHECKPOINT_EXTENSION))
    }

    /// Writes the checkpoint next to its final path and renames it into
    /// place, so a reader sees the old file or the new one.
    pub fn save(&self, checkpoint: &ViewCheckpoint) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            IndexError::Io(format!("Failed to create checkpoint directory: {}", e))
        })?;
        let bytes = checkpoint.encode()?;
        let path = self.path_for(&checkpoint.view_id);

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| IndexError::Io(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&bytes)
            .map_err(|e| IndexError::Io(format!("Failed to write checkpoint: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| IndexError::Io(format!("Failed to sync checkpoint: {}", e)))?;
        temp.persist(&path)
            .map_err(|e| IndexError::Io(format!("Failed to rename checkpoint: {}", e.error)))?;
        Ok(path)
    }

    pub fn load(&self, view_id: &str) -> Result<Option<ViewCheckpoint>> {
        let path = self.path_for(view_id);
        if !path.exists() {
            return Ok(None);
        }
        ViewCheckpoint::read_file(&path).map(Some)
    }

    pub fn exists(&self, view_id: &str) -> bool {
        self.path_for(view_id).exists()
    }

    pub fn delete(&self, view_id: &str) -> Result<()> {
        let path = self.path_for(view_id);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| IndexError::Io(format!("Failed to delete checkpoint: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DocId;
    use crate::reduce::CountCombiner;
    use tempfile::TempDir;

    fn sample_index() -> ViewIndex {
        let mut index = ViewIndex::new(Some(Arc::new(CountCombiner)));
        for (doc, key) in [("s1", "NEW"), ("s2", "DONE"), ("s3", "NEW")] {
            index.apply_document(
                &DocId::new(doc),
                vec![(EntryKey::new(key, doc, 0), Value::Null)],
            );
        }
        index.advance_watermark(ChangeSeq(3));
        index
    }

    #[test]
    fn test_checkpoint_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        let checkpoint = ViewCheckpoint::capture("sample/status", &ReduceSpec::Count, &sample_index());

        let path = store.save(&checkpoint).unwrap();
        assert!(path.ends_with("sample~status.view"));
        assert!(store.exists("sample/status"));

        let loaded = store.load("sample/status").unwrap().unwrap();
        assert!(loaded.matches("sample/status", &ReduceSpec::Count));
        assert!(!loaded.matches("sample/status", &ReduceSpec::sum()));
        assert_eq!(loaded.header().entries, 3);

        let index = loaded.into_index(Some(Arc::new(CountCombiner))).unwrap();
        index.verify().unwrap();
        assert_eq!(index.watermark(), ChangeSeq(3));
        assert_eq!(index.documents(), 3);
    }

    #[test]
    fn test_missing_checkpoint_loads_as_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        assert!(store.load("user/email").unwrap().is_none());
        store.delete("user/email").unwrap();
    }

    #[test]
    fn test_garbage_checkpoint_is_a_serialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        fs::write(store.path_for("user/email"), b"not msgpack").unwrap();
        assert!(matches!(
            store.load("user/email"),
            Err(IndexError::Serialization(_))
        ));
    }
}
