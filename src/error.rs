//! Error types for pilot-transfer
//!
//! This module provides the error taxonomy for the transfer engine:
//! - Transfer errors scoped to a single chunk or unit (transport, integrity, finalize)
//! - Service rejections returned by the platform as a closed set of kinds
//! - Session errors (missing login, expired credentials, failed refresh)
//! - Batch-level errors (configuration, manifest, I/O)

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pilot-transfer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pilot-transfer
///
/// Unit-scoped failures are carried by [`TransferError`] so the scheduler can
/// isolate them; everything else aborts the operation that produced it.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "chunk_size")
        key: Option<String>,
    },

    /// A remote call answered with an unexpected HTTP status
    #[error("{operation} failed with HTTP {status}: {body}")]
    Http {
        /// Which call failed (e.g., "chunk upload", "finalize")
        operation: &'static str,
        /// The HTTP status code returned
        status: u16,
        /// Response body, kept for diagnostics
        body: String,
    },

    /// The platform rejected the request
    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    /// Session or credential problem
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Chunk or unit level transfer failure
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// The download preparation job reached FAILED
    #[error("download preparation {hash_code} failed")]
    DownloadFailed {
        /// Opaque handle of the preparation job
        hash_code: String,
    },

    /// The download preparation job did not finish within the configured wait
    #[error("download preparation {hash_code} still pending after {waited_secs}s")]
    DownloadTimedOut {
        /// Opaque handle of the preparation job
        hash_code: String,
        /// Seconds spent polling before giving up
        waited_secs: u64,
    },

    /// The download target exists and the collision action forbids replacing it
    #[error("{path} already exists")]
    DestinationExists {
        /// Existing file
        path: PathBuf,
    },

    /// Resume manifest missing fields or inconsistent
    #[error("invalid resume manifest {path}: {reason}")]
    InvalidManifest {
        /// Manifest location
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// The platform answered with a body we could not interpret
    #[error("unexpected response from {operation}: {reason}")]
    UnexpectedResponse {
        /// Which call produced the response
        operation: &'static str,
        /// What was missing or malformed
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Folder compression failed
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Closed set of rejections the platform services return
///
/// The HTTP client maps status codes (and, for two legacy cases, error text)
/// onto these kinds; callers match on the kind, never on the text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The user lacks permission on the target folder
    #[error("permission denied")]
    PermissionDenied,

    /// The user is not a member of the project
    #[error("project access denied")]
    ProjectDenied,

    /// An item already exists at the target path
    #[error("file already exists at the destination")]
    FileExists,

    /// The target is locked by another operation
    #[error("file is locked by another operation")]
    FileLocked,

    /// The multipart upload id recorded in the manifest no longer exists
    #[error("upload id does not exist; the upload must be restarted")]
    UploadIdNotExist,

    /// The user may not download the requested item
    #[error("no permission to download the requested item")]
    NoFilePermission,

    /// The requested folder has nothing to download
    #[error("folder is empty")]
    FolderEmpty,
}

/// Session and credential errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// No stored session was found
    #[error("login session not found at {path}, please login first")]
    NotLoggedIn {
        /// Where the session file was expected
        path: PathBuf,
    },

    /// The token is expired or issued for another client; a new login is needed
    #[error("login session is no longer valid, please login again")]
    LoginRequired,

    /// The access token could not be decoded
    #[error("malformed access token: {0}")]
    MalformedToken(String),

    /// The identity service refused to refresh the token
    #[error("token refresh failed with HTTP {status}: {body}")]
    RefreshFailed {
        /// The HTTP status code returned
        status: u16,
        /// Response body, kept for diagnostics
        body: String,
    },
}

/// Failures that abort a single transfer unit without touching its siblings
#[derive(Debug, Error)]
pub enum TransferError {
    /// A chunk could not be transported after all retry attempts
    #[error("chunk {index} of {object_path} failed after {attempts} attempts: {reason}")]
    ChunkTransportFailed {
        /// Destination path of the owning unit
        object_path: String,
        /// 1-based chunk index
        index: u32,
        /// Number of attempts made
        attempts: u32,
        /// The last error seen
        reason: String,
    },

    /// A previously uploaded chunk no longer matches the local file
    #[error("chunk {index} of {local_path} changed since it was uploaded")]
    ResumeIntegrity {
        /// Local source file
        local_path: PathBuf,
        /// 1-based chunk index
        index: u32,
    },

    /// The local file size differs from the size recorded in the manifest
    #[error("{local_path} changed size since the upload started ({recorded} -> {actual} bytes)")]
    LocalFileChanged {
        /// Local source file
        local_path: PathBuf,
        /// Size recorded at pre-registration
        recorded: u64,
        /// Size on disk now
        actual: u64,
    },

    /// The recorded chunk count does not fit the chunk size used to resume
    #[error(
        "{local_path} was uploaded as {recorded} chunks but splits into {computed} chunks of {chunk_size} bytes"
    )]
    ChunkLayoutMismatch {
        /// Local source file
        local_path: PathBuf,
        /// Chunk count recorded at pre-registration
        recorded: u32,
        /// Chunk count with `chunk_size`
        computed: u32,
        /// Chunk size the resume would use
        chunk_size: u64,
    },

    /// The metadata service did not commit the unit
    #[error("finalize of {object_path} failed after {attempts} attempts: {reason}")]
    FinalizeFailed {
        /// Destination path of the unit
        object_path: String,
        /// Number of attempts made
        attempts: u32,
        /// The last error seen
        reason: String,
    },

    /// The unit was never pre-registered
    #[error("{object_path} has no transfer id; pre-registration did not complete")]
    NotRegistered {
        /// Destination path of the unit
        object_path: String,
    },
}

impl Error {
    /// Shorthand for a configuration error on a specific key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
