//! Durable record of an upload batch
//!
//! Written once after pre-registration and read back wholesale to resume.
//! Remote chunk state is re-queried on resume, so the file is never updated
//! while chunks are in flight.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Zone;
use crate::error::{Error, Result};

/// One file of the batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Multipart upload id
    pub resumable_id: String,
    /// Platform job id
    pub job_id: String,
    /// Item id
    pub item_id: String,
    /// Destination path in the project namespace
    pub object_path: String,
    /// Local source file
    pub local_path: PathBuf,
    /// File size at pre-registration
    pub total_size: u64,
    /// Chunk count at pre-registration
    pub total_chunks: u32,
    /// Chunk size the file was split with; 0 in manifests that predate it
    #[serde(default)]
    pub chunk_size: u64,
    /// Chunks known to be in storage, keyed by 1-based index
    #[serde(default)]
    pub uploaded_chunks: BTreeMap<u32, String>,
}

/// Batch-level resume record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeManifest {
    /// Project the batch uploads into
    pub project_code: String,
    /// User that started the upload
    pub operator: String,
    /// Target zone
    pub zone: Zone,
    /// Id of the destination folder's parent
    #[serde(default)]
    pub parent_folder_id: String,
    /// Destination folder path
    #[serde(default)]
    pub current_folder_node: String,
    /// Tags attached at finalize
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form message recorded with the upload
    #[serde(default)]
    pub upload_message: String,
    /// Files of the batch keyed by item id
    #[serde(default)]
    pub file_objects: BTreeMap<String, FileRecord>,
}

impl ResumeManifest {
    /// Empty manifest for a batch.
    pub fn new(project_code: impl Into<String>, operator: impl Into<String>, zone: Zone) -> Self {
        Self {
            project_code: project_code.into(),
            operator: operator.into(),
            zone,
            parent_folder_id: String::new(),
            current_folder_node: String::new(),
            tags: Vec::new(),
            upload_message: String::new(),
            file_objects: BTreeMap::new(),
        }
    }

    /// Add (or replace) a file record, keyed by its item id.
    pub fn insert(&mut self, record: FileRecord) {
        self.file_objects.insert(record.item_id.clone(), record);
    }

    /// Write the manifest as JSON.
    ///
    /// The file is written next to its destination and renamed into place, so
    /// an interrupted write never leaves a truncated manifest behind.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::info!(
            path = %path.display(),
            files = self.file_objects.len(),
            "Resume manifest written"
        );
        Ok(())
    }

    /// Read a manifest written by [`ResumeManifest::save`].
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| Error::InvalidManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let manifest: Self = serde_json::from_slice(&raw).map_err(|e| Error::InvalidManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        manifest.check(path)?;
        Ok(manifest)
    }

    fn check(&self, path: &Path) -> Result<()> {
        if self.project_code.is_empty() {
            return Err(Error::InvalidManifest {
                path: path.to_path_buf(),
                reason: "missing project code".to_string(),
            });
        }
        for (item_id, record) in &self.file_objects {
            if record.resumable_id.is_empty() {
                return Err(Error::InvalidManifest {
                    path: path.to_path_buf(),
                    reason: format!("{} has no upload id", record.object_path),
                });
            }
            if *item_id != record.item_id {
                return Err(Error::InvalidManifest {
                    path: path.to_path_buf(),
                    reason: format!("entry {item_id} holds item {}", record.item_id),
                });
            }
        }
        Ok(())
    }
}
