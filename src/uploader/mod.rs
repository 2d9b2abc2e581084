//! Upload and resume flows
//!
//! An upload discovers the source files, pre-registers them in batches,
//! records the batch in a resume manifest and hands the units to the
//! [`TransferScheduler`]. A resume starts from the manifest instead: items the
//! platform still reports as `REGISTERED` are rebuilt, their stored chunks
//! are looked up and the scheduler sends only what is missing.

mod discover;

pub use discover::{Discovered, SourceFile, discover, zip_folder};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::{Config, RetryConfig, TransferConfig, Zone};
use crate::error::{Error, Result};
use crate::keepalive::TokenKeepAlive;
use crate::manifest::ResumeManifest;
use crate::scheduler::{BatchReport, Container, Finalizer, TransferScheduler, UnitFailure};
use crate::services::{
    FinalizeRequest, MetadataService, NewFile, PreRegisterRequest, ResumeLookupRequest,
    ResumeTarget,
};
use crate::transport::ChunkTransport;
use crate::types::{Event, ItemStatus};
use crate::unit::TransferUnit;

/// Buffered events before slow subscribers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Where the resume manifest goes unless a request names another path
pub const DEFAULT_MANIFEST_PATH: &str = "manifest.json";

/// A local file or folder to upload
#[derive(Clone, Debug)]
pub struct UploadRequest {
    /// Local file or folder
    pub source: PathBuf,
    /// Project receiving the upload
    pub project_code: String,
    /// Target zone
    pub zone: Zone,
    /// Destination folder in the project namespace
    pub target_folder: String,
    /// Id of the destination folder's parent
    pub parent_folder_id: String,
    /// Tags attached to every file
    pub tags: Vec<String>,
    /// Free-form message recorded with the upload
    pub upload_message: String,
    /// Upload a folder as one zip archive
    pub compress_zip: bool,
    /// Where to write the resume manifest (default: `manifest.json`)
    pub manifest_path: PathBuf,
}

impl Default for UploadRequest {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            project_code: String::new(),
            zone: Zone::default(),
            target_folder: String::new(),
            parent_folder_id: String::new(),
            tags: Vec::new(),
            upload_message: String::new(),
            compress_zip: false,
            manifest_path: PathBuf::from(DEFAULT_MANIFEST_PATH),
        }
    }
}

/// Outcome of an upload or resume
#[derive(Debug, Default)]
pub struct UploadReport {
    /// Item ids of every file the run worked on
    pub item_ids: Vec<String>,
    /// Per-unit results
    pub batch: BatchReport,
}

impl UploadReport {
    /// Whether at least one file committed, or nothing failed.
    pub fn is_success(&self) -> bool {
        self.batch.is_success()
    }
}

/// Commits units through the metadata service
struct UploadFinalizer {
    metadata: Arc<dyn MetadataService>,
    project_code: String,
    operator: String,
    zone: Zone,
    tags: Vec<String>,
    upload_message: String,
}

#[async_trait]
impl Finalizer for UploadFinalizer {
    async fn finalize(&self, unit: &TransferUnit) -> Result<String> {
        let request = FinalizeRequest {
            project_code: self.project_code.clone(),
            operator: self.operator.clone(),
            zone: self.zone,
            registration: unit.registration().clone(),
            file_name: unit.file_name().to_string(),
            relative_path: unit.parent_path().to_string(),
            total_chunks: unit.total_chunks(),
            total_size: unit.total_size(),
            tags: self.tags.clone(),
            upload_message: self.upload_message.clone(),
            process_pipeline: None,
        };
        self.metadata.finalize(&request).await
    }
}

/// Runs uploads and resumes against the platform
pub struct Uploader {
    metadata: Arc<dyn MetadataService>,
    transport: ChunkTransport,
    operator: String,
    transfer: TransferConfig,
    retry: RetryConfig,
    keepalive: Option<TokenKeepAlive>,
    event_tx: broadcast::Sender<Event>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("operator", &self.operator)
            .field("transfer", &self.transfer)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Uploader acting as `operator`.
    pub fn new(
        metadata: Arc<dyn MetadataService>,
        transport: ChunkTransport,
        operator: impl Into<String>,
        config: &Config,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            metadata,
            transport,
            operator: operator.into(),
            transfer: config.transfer.clone(),
            retry: config.retry.clone(),
            keepalive: None,
            event_tx,
        }
    }

    /// Keep the session alive while chunks are in flight.
    pub fn with_keepalive(mut self, keepalive: TokenKeepAlive) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Subscribe to upload events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Upload `request.source`.
    ///
    /// Discovery, pre-registration and the manifest write happen before any
    /// chunk moves; a failure there aborts the whole upload. After that, units
    /// fail individually and are listed in the report.
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadReport> {
        let discovered = discover(
            &request.source,
            &request.target_folder,
            request.compress_zip,
            !request.tags.is_empty(),
        )?;
        tracing::info!(
            source = %request.source.display(),
            upload_type = %discovered.upload_type,
            files = discovered.files.len(),
            "Upload started"
        );

        let mut units = discovered
            .files
            .iter()
            .map(|file| {
                TransferUnit::new(
                    &file.local_path,
                    file.object_path.clone(),
                    self.transfer.chunk_size,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut manifest =
            ResumeManifest::new(&request.project_code, &self.operator, request.zone);
        manifest.current_folder_node = discovered.folder_node.clone();
        manifest.parent_folder_id = request.parent_folder_id.clone();
        manifest.tags = request.tags.clone();
        manifest.upload_message = request.upload_message.clone();

        for batch in units.chunks_mut(self.transfer.upload_batch_size.max(1)) {
            self.pre_register(request, &discovered, batch).await?;
        }
        self.event_tx
            .send(Event::PreRegistered { files: units.len() })
            .ok();

        for unit in &units {
            manifest.insert(unit.to_record());
        }
        manifest.save(&request.manifest_path).await?;

        let item_ids = units.iter().map(|u| u.item_id().to_string()).collect();
        let batch = self.schedule(&manifest, units).await;

        if let Some(archive) = &discovered.archive
            && batch.failed.is_empty()
            && let Err(e) = tokio::fs::remove_file(archive).await
        {
            tracing::warn!(archive = %archive.display(), error = %e, "Failed to remove archive");
        }

        Ok(UploadReport { item_ids, batch })
    }

    /// Continue an upload recorded in the manifest at `manifest_path`.
    ///
    /// Items already committed are skipped. An upload id the platform no
    /// longer knows aborts the resume with `ServiceError::UploadIdNotExist`.
    pub async fn resume(&self, manifest_path: &Path) -> Result<UploadReport> {
        let manifest = ResumeManifest::load(manifest_path).await?;
        let item_ids: Vec<String> = manifest.file_objects.keys().cloned().collect();
        let states = if item_ids.is_empty() {
            Vec::new()
        } else {
            self.metadata.item_statuses(&item_ids).await?
        };

        let mut report = UploadReport::default();
        let mut units = Vec::new();
        for state in states {
            if state.status != ItemStatus::Registered {
                tracing::debug!(item_id = %state.item_id, status = ?state.status, "Item not resumable");
                continue;
            }
            let Some(record) = manifest.file_objects.get(&state.item_id) else {
                tracing::warn!(item_id = %state.item_id, "Status for an item not in the manifest");
                continue;
            };
            report.item_ids.push(record.item_id.clone());
            match TransferUnit::from_record(record, self.transfer.chunk_size) {
                Ok(unit) => units.push(unit),
                Err(error) => report.batch.failed.push(UnitFailure {
                    object_path: record.object_path.clone(),
                    local_path: record.local_path.clone(),
                    error,
                }),
            }
        }
        tracing::info!(
            manifest = %manifest_path.display(),
            unfinished = units.len(),
            "Resuming upload"
        );

        if !units.is_empty() {
            self.fill_uploaded_chunks(&manifest, &mut units).await?;
        }
        self.event_tx
            .send(Event::ResumeChecked { files: units.len() })
            .ok();

        let batch = self.schedule(&manifest, units).await;
        report.batch.completed.extend(batch.completed);
        report.batch.failed.extend(batch.failed);
        Ok(report)
    }

    async fn pre_register(
        &self,
        request: &UploadRequest,
        discovered: &Discovered,
        batch: &mut [TransferUnit],
    ) -> Result<()> {
        let registered = self
            .metadata
            .pre_register(&PreRegisterRequest {
                project_code: request.project_code.clone(),
                operator: self.operator.clone(),
                upload_type: discovered.upload_type,
                zone: request.zone,
                current_folder_node: discovered.folder_node.clone(),
                parent_folder_id: request.parent_folder_id.clone(),
                folder_tags: request.tags.clone(),
                files: batch
                    .iter()
                    .map(|unit| NewFile {
                        file_name: unit.file_name().to_string(),
                        relative_path: unit.parent_path().to_string(),
                    })
                    .collect(),
            })
            .await?;

        let mut by_path: HashMap<String, _> = registered
            .into_iter()
            .map(|file| (file.object_path, file.registration))
            .collect();
        for unit in batch.iter_mut() {
            let registration =
                by_path
                    .remove(unit.object_path())
                    .ok_or_else(|| Error::UnexpectedResponse {
                        operation: "pre-registration",
                        reason: format!("no transfer id for {}", unit.object_path()),
                    })?;
            unit.assign(registration);
        }
        tracing::info!(files = batch.len(), "Files pre-registered");
        Ok(())
    }

    async fn fill_uploaded_chunks(
        &self,
        manifest: &ResumeManifest,
        units: &mut [TransferUnit],
    ) -> Result<()> {
        let request = ResumeLookupRequest {
            project_code: manifest.project_code.clone(),
            bucket: manifest.zone.bucket_for(&manifest.project_code),
            zone: manifest.zone,
            targets: units
                .iter()
                .map(|unit| ResumeTarget {
                    object_path: unit.object_path().to_string(),
                    item_id: unit.item_id().to_string(),
                    transfer_id: unit.transfer_id().to_string(),
                })
                .collect(),
        };
        let mut remote: HashMap<String, _> = self
            .metadata
            .resume_lookup(&request)
            .await?
            .into_iter()
            .map(|state| (state.transfer_id, state.chunks))
            .collect();

        for unit in units.iter_mut() {
            let chunks = remote.remove(unit.transfer_id()).unwrap_or_default();
            tracing::debug!(
                object_path = %unit.object_path(),
                stored = chunks.len(),
                total = unit.total_chunks(),
                "Remote chunk state"
            );
            unit.set_uploaded_chunks(chunks);
        }
        Ok(())
    }

    async fn schedule(&self, manifest: &ResumeManifest, units: Vec<TransferUnit>) -> BatchReport {
        if units.is_empty() {
            return BatchReport::default();
        }
        let mut scheduler = TransferScheduler::new(
            self.transport.clone(),
            Container::for_project(manifest.zone, &manifest.project_code),
            self.transfer.concurrency,
            self.retry.clone(),
        )
        .with_events(self.event_tx.clone());
        if let Some(keepalive) = &self.keepalive {
            scheduler = scheduler.with_keepalive(keepalive.clone());
        }

        let finalizer = Arc::new(UploadFinalizer {
            metadata: self.metadata.clone(),
            project_code: manifest.project_code.clone(),
            operator: manifest.operator.clone(),
            zone: manifest.zone,
            tags: manifest.tags.clone(),
            upload_message: manifest.upload_message.clone(),
        });
        scheduler.run(units, finalizer).await
    }
}
