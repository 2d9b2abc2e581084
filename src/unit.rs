//! In-memory transfer state of one file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::chunk::{self, ChunkReader};
use crate::error::{Result, TransferError};
use crate::manifest::FileRecord;

/// Ids the metadata service hands out at pre-registration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registration {
    /// Multipart/resumable upload identifier
    pub transfer_id: String,
    /// Platform job tracking the upload
    pub job_id: String,
    /// Item created for the file
    pub item_id: String,
}

/// One file's multi-chunk transfer
///
/// Paths and sizes are fixed at construction. Ids are filled in by
/// pre-registration and `uploaded_chunks` grows as chunks reach storage.
#[derive(Clone, Debug)]
pub struct TransferUnit {
    local_path: PathBuf,
    object_path: String,
    chunk_size: u64,
    total_size: u64,
    total_chunks: u32,
    registration: Registration,
    uploaded_chunks: BTreeMap<u32, String>,
}

impl TransferUnit {
    /// Create a unit for `local_path`, sizing it from the file on disk.
    pub fn new(
        local_path: impl Into<PathBuf>,
        object_path: impl Into<String>,
        chunk_size: u64,
    ) -> Result<Self> {
        let local_path = local_path.into();
        let total_size = std::fs::metadata(&local_path)?.len();
        Ok(Self {
            local_path,
            object_path: object_path.into(),
            chunk_size,
            total_size,
            total_chunks: chunk::total_chunks(total_size, chunk_size),
            registration: Registration::default(),
            uploaded_chunks: BTreeMap::new(),
        })
    }

    /// Rebuild a unit from its manifest record.
    ///
    /// The unit is split with the chunk size recorded in the manifest;
    /// `fallback_chunk_size` only applies to records that carry none. The
    /// local file must still have the recorded size; content changes are
    /// caught later, chunk by chunk, against the remote fingerprints.
    pub fn from_record(record: &FileRecord, fallback_chunk_size: u64) -> Result<Self> {
        let actual = std::fs::metadata(&record.local_path)?.len();
        if actual != record.total_size {
            return Err(TransferError::LocalFileChanged {
                local_path: record.local_path.clone(),
                recorded: record.total_size,
                actual,
            }
            .into());
        }

        let chunk_size = if record.chunk_size > 0 {
            record.chunk_size
        } else {
            fallback_chunk_size
        };
        let computed = chunk::total_chunks(record.total_size, chunk_size);
        if computed != record.total_chunks {
            return Err(TransferError::ChunkLayoutMismatch {
                local_path: record.local_path.clone(),
                recorded: record.total_chunks,
                computed,
                chunk_size,
            }
            .into());
        }

        Ok(Self {
            local_path: record.local_path.clone(),
            object_path: record.object_path.clone(),
            chunk_size,
            total_size: record.total_size,
            total_chunks: computed,
            registration: Registration {
                transfer_id: record.resumable_id.clone(),
                job_id: record.job_id.clone(),
                item_id: record.item_id.clone(),
            },
            uploaded_chunks: record.uploaded_chunks.clone(),
        })
    }

    /// Manifest record for this unit.
    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            resumable_id: self.registration.transfer_id.clone(),
            job_id: self.registration.job_id.clone(),
            item_id: self.registration.item_id.clone(),
            object_path: self.object_path.clone(),
            local_path: self.local_path.clone(),
            total_size: self.total_size,
            total_chunks: self.total_chunks,
            chunk_size: self.chunk_size,
            uploaded_chunks: self.uploaded_chunks.clone(),
        }
    }

    /// Local source file
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Destination path in the project namespace
    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// Last path segment of the destination
    pub fn file_name(&self) -> &str {
        self.object_path
            .rsplit_once('/')
            .map_or(self.object_path.as_str(), |(_, name)| name)
    }

    /// Destination folder (everything before the last segment)
    pub fn parent_path(&self) -> &str {
        self.object_path
            .rsplit_once('/')
            .map_or("", |(parent, _)| parent)
    }

    /// Chunk size the unit was split with
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// File size in bytes
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of chunks
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Length of the 1-based chunk `index`
    pub fn chunk_len(&self, index: u32) -> u64 {
        chunk::chunk_len(self.total_size, self.chunk_size, index)
    }

    /// Ids from pre-registration
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Multipart upload id (empty before pre-registration)
    pub fn transfer_id(&self) -> &str {
        &self.registration.transfer_id
    }

    /// Item id (empty before pre-registration)
    pub fn item_id(&self) -> &str {
        &self.registration.item_id
    }

    /// Whether pre-registration assigned ids
    pub fn is_registered(&self) -> bool {
        !self.registration.transfer_id.is_empty()
    }

    /// Record the ids returned by pre-registration.
    pub fn assign(&mut self, registration: Registration) {
        self.registration = registration;
    }

    /// Chunks already accepted by storage, by index
    pub fn uploaded_chunks(&self) -> &BTreeMap<u32, String> {
        &self.uploaded_chunks
    }

    /// Replace the uploaded-chunk map with remote state from a resume lookup.
    pub fn set_uploaded_chunks(&mut self, chunks: BTreeMap<u32, String>) {
        self.uploaded_chunks = chunks;
    }

    /// Remember that chunk `index` reached storage with `fingerprint`.
    pub fn record_chunk(&mut self, index: u32, fingerprint: String) {
        self.uploaded_chunks.insert(index, fingerprint);
    }

    /// Whether every chunk `1..=total_chunks` is accounted for
    pub fn is_complete(&self) -> bool {
        (1..=self.total_chunks).all(|i| self.uploaded_chunks.contains_key(&i))
    }

    /// Reader over the local file using the unit's chunk size
    pub fn reader(&self) -> ChunkReader {
        ChunkReader::new(&self.local_path, self.chunk_size)
    }
}
