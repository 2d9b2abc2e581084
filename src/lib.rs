//! # pilot-transfer
//!
//! Chunked, resumable upload and download engine for the Pilot data platform.
//!
//! ## Design
//!
//! - **Chunked** - files move as fixed-size chunks through presigned storage
//!   locations, a bounded number at a time
//! - **Resumable** - an upload batch is recorded in a manifest; a resume sends
//!   only the chunks storage does not already hold
//! - **Isolated failures** - one file failing never stops its siblings
//! - **Event-driven** - consumers subscribe to progress events, no polling
//!
//! ## Quick Start
//!
//! ```no_run
//! use pilot_transfer::{Config, TransferEngine, UploadRequest, Zone};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let engine = TransferEngine::connect(config, Path::new("session.json")).await?;
//!
//!     let mut events = engine.uploader().subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = engine
//!         .uploader()
//!         .upload(&UploadRequest {
//!             source: "./scans".into(),
//!             project_code: "indoc".to_string(),
//!             zone: Zone::Greenroom,
//!             target_folder: "alice/raw".to_string(),
//!             manifest_path: "upload-manifest.json".into(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("{} files committed", report.batch.completed.len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Chunk arithmetic and chunk reads
pub mod chunk;
/// HTTP clients for the platform services
pub mod client;
/// Configuration types
pub mod config;
/// Download flow and preparation polling
pub mod downloader;
/// Client wiring
pub mod engine;
/// Error types
pub mod error;
/// Background token refresh
pub mod keepalive;
/// Resume manifest
pub mod manifest;
/// Retry logic with linear backoff
pub mod retry;
/// Bounded chunk worker pool
pub mod scheduler;
/// Service interfaces
pub mod services;
/// Login session and token handling
pub mod session;
/// Chunk and stream transport
pub mod transport;
/// Core types and events
pub mod types;
/// Per-file transfer state
pub mod unit;
/// Upload and resume flows
pub mod uploader;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use client::{IdentityClient, PlatformClient};
pub use config::{Config, FileCollisionAction, Zone};
pub use downloader::{DownloadOutcome, DownloadRequest, DownloadStatusPoller, Downloader};
pub use engine::TransferEngine;
pub use error::{Error, Result, ServiceError, SessionError, TransferError};
pub use keepalive::{KeepAliveHandle, TokenKeepAlive};
pub use manifest::{FileRecord, ResumeManifest};
pub use scheduler::{BatchReport, CompletedUnit, Container, Finalizer, TransferScheduler, UnitFailure};
pub use session::{Session, SessionParams, TokenState};
pub use transport::{ChunkTransport, ResumeCheck};
pub use types::{DownloadJob, DownloadStatus, Event, ItemStatus, UploadType};
pub use unit::{Registration, TransferUnit};
pub use uploader::{DEFAULT_MANIFEST_PATH, UploadReport, UploadRequest, Uploader};
