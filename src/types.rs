//! Core types and events for pilot-transfer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a batch is registered with the platform
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadType {
    /// Single file (or a folder compressed into one archive)
    #[default]
    #[serde(rename = "AS_FILE")]
    AsFile,
    /// Every file of a folder, keeping its layout
    #[serde(rename = "AS_FOLDER")]
    AsFolder,
}

impl std::fmt::Display for UploadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadType::AsFile => f.write_str("AS_FILE"),
            UploadType::AsFolder => f.write_str("AS_FOLDER"),
        }
    }
}

/// Lifecycle of an item in the metadata service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    /// Created by pre-registration, upload not complete
    Registered,
    /// Upload complete
    Active,
    /// Deleted
    Archived,
}

/// State of a remote download preparation job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DownloadStatus {
    /// Queued on the platform
    Waiting,
    /// Being prepared (e.g. zipped)
    Running,
    /// Ready to stream
    Succeed,
    /// Preparation failed
    Failed,
}

impl DownloadStatus {
    /// Whether polling can stop
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Succeed | DownloadStatus::Failed)
    }
}

/// Remote preparation job for a download
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadJob {
    /// Opaque handle returned by the preparation call
    pub hash_code: String,
    /// Last known status
    pub status: DownloadStatus,
    /// Total bytes, known only for some jobs (zip/batch)
    pub total_size: Option<u64>,
    /// Platform path of the prepared file, when the handle carries it
    pub file_path: Option<String>,
}

/// Events emitted while transfers run
///
/// Subscribe through [`crate::TransferScheduler::subscribe`] or the uploader /
/// downloader handles. Progress counters only grow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Files were registered and received transfer ids
    PreRegistered {
        /// Number of files in the batch
        files: usize,
    },

    /// Remote chunk state was fetched for a resume
    ResumeChecked {
        /// Number of unfinished files
        files: usize,
    },

    /// One chunk reached storage
    ChunkUploaded {
        /// Destination path of the unit
        object_path: String,
        /// 1-based chunk index
        index: u32,
        /// Chunk length
        bytes: u64,
    },

    /// A chunk was already in storage and its fingerprint still matches
    ChunkSkipped {
        /// Destination path of the unit
        object_path: String,
        /// 1-based chunk index
        index: u32,
    },

    /// Byte progress of a unit
    UnitProgress {
        /// Destination path of the unit
        object_path: String,
        /// Bytes confirmed so far
        transferred: u64,
        /// Size of the file
        total: u64,
    },

    /// A unit was committed by the metadata service
    UnitFinalized {
        /// Destination path of the unit
        object_path: String,
        /// Committed item id
        item_id: String,
    },

    /// A unit failed; siblings continue
    UnitFailed {
        /// Destination path of the unit
        object_path: String,
        /// Cause
        error: String,
    },

    /// The keep-alive rotated the access token
    TokenRefreshed,

    /// A preparation status poll returned
    DownloadPreparing {
        /// Preparation handle
        hash_code: String,
        /// Reported status
        status: DownloadStatus,
    },

    /// Bytes written to the download target
    DownloadProgress {
        /// Local destination
        path: PathBuf,
        /// Bytes written so far
        downloaded: u64,
        /// Total size when known; `None` means indeterminate progress
        total: Option<u64>,
    },

    /// Download finished
    DownloadComplete {
        /// Local destination
        path: PathBuf,
        /// Bytes written
        bytes: u64,
    },
}
