//! Interfaces to the platform services the engine depends on
//!
//! The engine only talks to its collaborators through these traits.
//! [`crate::client`] implements them over HTTP; tests substitute in-memory
//! doubles.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::Zone;
use crate::error::Result;
use crate::types::{DownloadJob, ItemStatus, UploadType};
use crate::unit::Registration;

/// One file to pre-register
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFile {
    /// File name at the destination
    pub file_name: String,
    /// Destination folder path
    pub relative_path: String,
}

/// Batch pre-registration request
#[derive(Clone, Debug)]
pub struct PreRegisterRequest {
    /// Project receiving the files
    pub project_code: String,
    /// User performing the upload
    pub operator: String,
    /// Whether the batch is a file or a folder upload
    pub upload_type: UploadType,
    /// Target zone
    pub zone: Zone,
    /// Destination folder path
    pub current_folder_node: String,
    /// Id of the destination folder's parent
    pub parent_folder_id: String,
    /// Tags applied to created folders
    pub folder_tags: Vec<String>,
    /// Files to register
    pub files: Vec<NewFile>,
}

/// Ids assigned to one registered file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredFile {
    /// Destination path the ids belong to
    pub object_path: String,
    /// Assigned ids
    pub registration: Registration,
}

/// One unfinished upload to look up
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeTarget {
    /// Destination path
    pub object_path: String,
    /// Item id
    pub item_id: String,
    /// Multipart upload id
    pub transfer_id: String,
}

/// Resume lookup request
#[derive(Clone, Debug)]
pub struct ResumeLookupRequest {
    /// Project of the batch
    pub project_code: String,
    /// Bucket holding the parts
    pub bucket: String,
    /// Target zone
    pub zone: Zone,
    /// Uploads to look up
    pub targets: Vec<ResumeTarget>,
}

/// Chunks already in storage for one upload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteChunkState {
    /// Multipart upload id
    pub transfer_id: String,
    /// Fingerprint per 1-based chunk index
    pub chunks: BTreeMap<u32, String>,
}

/// Commit request for a fully uploaded unit
#[derive(Clone, Debug)]
pub struct FinalizeRequest {
    /// Project of the batch
    pub project_code: String,
    /// User performing the upload
    pub operator: String,
    /// Target zone
    pub zone: Zone,
    /// Ids from pre-registration
    pub registration: Registration,
    /// File name at the destination
    pub file_name: String,
    /// Destination folder path
    pub relative_path: String,
    /// Number of chunks uploaded
    pub total_chunks: u32,
    /// File size in bytes
    pub total_size: u64,
    /// Tags attached to the item
    pub tags: Vec<String>,
    /// Free-form upload message
    pub upload_message: String,
    /// Optional processing pipeline to trigger
    pub process_pipeline: Option<String>,
}

/// Current status of an item
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemState {
    /// Item id
    pub item_id: String,
    /// Lifecycle status
    pub status: ItemStatus,
}

/// Download preparation request
#[derive(Clone, Debug)]
pub struct PrepareDownloadRequest {
    /// Project the items belong to
    pub project_code: String,
    /// Items (files or folders) to download together
    pub item_ids: Vec<String>,
    /// Zone holding the items
    pub zone: Zone,
    /// User performing the download
    pub operator: String,
}

/// Where to write one chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkLocationRequest {
    /// Zone whose upload service issues the location
    pub zone: Zone,
    /// Bucket of the project and zone
    pub bucket: String,
    /// Object key (destination path)
    pub key: String,
    /// Multipart upload id
    pub transfer_id: String,
    /// 1-based chunk index
    pub chunk_index: u32,
}

/// Body of an object being read
pub struct ReadStream {
    /// Size from the response headers, when present
    pub total_size: Option<u64>,
    /// Content type from the response headers
    pub content_type: Option<String>,
    /// File name from `Content-Disposition`, when present
    pub file_name: Option<String>,
    /// Body bytes in arrival order
    pub body: BoxStream<'static, Result<Vec<u8>>>,
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("total_size", &self.total_size)
            .field("content_type", &self.content_type)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// Access/refresh token pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPair {
    /// Bearer token for protected calls
    pub access_token: String,
    /// Token used to obtain the next pair
    pub refresh_token: String,
}

/// Registration, commit and status calls
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Register files and obtain their transfer ids.
    async fn pre_register(&self, request: &PreRegisterRequest) -> Result<Vec<RegisteredFile>>;

    /// Fetch the chunks already stored for unfinished uploads.
    ///
    /// Fails with `ServiceError::UploadIdNotExist` when an upload id is unknown.
    async fn resume_lookup(&self, request: &ResumeLookupRequest) -> Result<Vec<RemoteChunkState>>;

    /// Commit a fully uploaded unit; returns the committed item id.
    async fn finalize(&self, request: &FinalizeRequest) -> Result<String>;

    /// Look up the lifecycle status of items.
    async fn item_statuses(&self, item_ids: &[String]) -> Result<Vec<ItemState>>;

    /// Ask the platform to prepare items for download.
    async fn prepare_download(&self, request: &PrepareDownloadRequest) -> Result<DownloadJob>;

    /// Current state of a preparation job.
    async fn download_status(&self, zone: Zone, hash_code: &str) -> Result<DownloadJob>;
}

/// Object-storage access
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Obtain a single-use write location for one chunk.
    async fn chunk_write_location(&self, request: &ChunkLocationRequest) -> Result<String>;

    /// Write chunk bytes to a location from [`StorageGateway::chunk_write_location`].
    ///
    /// `data` is cheap to clone, so a retried write reuses the same buffer.
    async fn put_chunk(&self, location: &str, data: Bytes) -> Result<()>;

    /// Read location of a prepared download.
    fn download_location(&self, zone: Zone, hash_code: &str) -> String;

    /// Open a read stream on a location.
    async fn open_read(&self, location: &str) -> Result<ReadStream>;
}

/// Token issuance
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Exchange a refresh token for a new token pair.
    async fn refresh(&self, client_id: &str, refresh_token: &str) -> Result<TokenPair>;
}
