//! Download flow: prepare, wait for the platform, stream to disk

mod poller;

pub use poller::DownloadStatusPoller;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::{DownloadConfig, FileCollisionAction, Zone};
use crate::error::{Error, Result};
use crate::services::{MetadataService, PrepareDownloadRequest};
use crate::transport::ChunkTransport;
use crate::types::Event;
use crate::utils::{filename_from_path, get_unique_path};

/// Buffered events before slow subscribers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Items to download together
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    /// Project the items belong to
    pub project_code: String,
    /// Zone holding the items
    pub zone: Zone,
    /// Item ids (files or folders)
    pub item_ids: Vec<String>,
    /// Name to fall back on when the platform does not name the file
    pub item_name: String,
    /// Local directory receiving the file
    pub dest_dir: PathBuf,
}

/// A finished download
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Preparation handle
    pub hash_code: String,
    /// Where the file was written
    pub path: PathBuf,
    /// Bytes written
    pub bytes: u64,
}

/// Downloads prepared items from the platform
pub struct Downloader {
    metadata: Arc<dyn MetadataService>,
    transport: ChunkTransport,
    poller: DownloadStatusPoller,
    operator: String,
    on_collision: FileCollisionAction,
    event_tx: broadcast::Sender<Event>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("operator", &self.operator)
            .field("on_collision", &self.on_collision)
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// Downloader acting as `operator`.
    pub fn new(
        metadata: Arc<dyn MetadataService>,
        transport: ChunkTransport,
        operator: impl Into<String>,
        config: &DownloadConfig,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let poller = DownloadStatusPoller::new(metadata.clone(), config).with_events(event_tx.clone());
        Self {
            metadata,
            transport,
            poller,
            operator: operator.into(),
            on_collision: config.on_collision,
            event_tx,
        }
    }

    /// Subscribe to preparation and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Prepare `request`, wait until the platform has it ready and stream it
    /// into `request.dest_dir`.
    ///
    /// The file is named after the platform path carried by the preparation
    /// handle, else the response's `Content-Disposition`, else
    /// `request.item_name`. An existing file is handled per the configured
    /// [`FileCollisionAction`].
    pub async fn download(&self, request: &DownloadRequest) -> Result<DownloadOutcome> {
        if request.item_ids.is_empty() {
            return Err(Error::Other("no items to download".to_string()));
        }

        let job = self
            .metadata
            .prepare_download(&PrepareDownloadRequest {
                project_code: request.project_code.clone(),
                item_ids: request.item_ids.clone(),
                zone: request.zone,
                operator: self.operator.clone(),
            })
            .await?;
        tracing::info!(
            hash_code = %job.hash_code,
            items = request.item_ids.len(),
            "Download prepared"
        );

        let ready = self
            .poller
            .wait_until_ready(request.zone, &job.hash_code)
            .await?;

        let location = self
            .transport
            .gateway()
            .download_location(request.zone, &job.hash_code);
        let stream = self.transport.open_stream(&location).await?;

        let file_name = ready
            .file_path
            .as_deref()
            .or(job.file_path.as_deref())
            .and_then(filename_from_path)
            .or_else(|| stream.file_name.clone())
            .or_else(|| filename_from_path(&request.item_name))
            .ok_or_else(|| {
                Error::Other(format!("no file name for download {}", job.hash_code))
            })?;

        tokio::fs::create_dir_all(&request.dest_dir).await?;
        let path = get_unique_path(&request.dest_dir.join(&file_name), self.on_collision)?;
        let known_total = ready.total_size.or(job.total_size);
        let bytes = self
            .transport
            .save_stream(stream, &path, known_total, Some(&self.event_tx))
            .await?;

        Ok(DownloadOutcome {
            hash_code: job.hash_code,
            path,
            bytes,
        })
    }
}
