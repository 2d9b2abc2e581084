//! Network exchange of single chunks and download streams

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::chunk;
use crate::config::RetryConfig;
use crate::error::{Result, TransferError};
use crate::retry::{Exhausted, IsRetryable, with_retry};
use crate::services::{ChunkLocationRequest, ReadStream, StorageGateway};
use crate::types::Event;
use crate::unit::TransferUnit;

/// Default write buffer for download streams
const DEFAULT_DOWNLOAD_BUFFER: usize = 64 * 1024;

/// Moves chunk bytes between local files and object storage
#[derive(Clone)]
pub struct ChunkTransport {
    gateway: Arc<dyn StorageGateway>,
    retry: RetryConfig,
    download_buffer_size: usize,
}

impl std::fmt::Debug for ChunkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTransport")
            .field("retry", &self.retry)
            .field("download_buffer_size", &self.download_buffer_size)
            .finish_non_exhaustive()
    }
}

/// Whether a chunk needs transport when resuming
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeCheck {
    /// Storage already holds identical bytes
    AlreadyUploaded,
    /// The chunk was never stored
    Pending,
}

impl ChunkTransport {
    /// Transport over `gateway` with the given retry policy.
    pub fn new(gateway: Arc<dyn StorageGateway>, retry: RetryConfig) -> Self {
        Self {
            gateway,
            retry,
            download_buffer_size: DEFAULT_DOWNLOAD_BUFFER,
        }
    }

    /// Use a different write buffer for downloads.
    pub fn with_download_buffer(mut self, size: usize) -> Self {
        self.download_buffer_size = size.max(1);
        self
    }

    /// Storage gateway in use
    pub fn gateway(&self) -> &Arc<dyn StorageGateway> {
        &self.gateway
    }

    /// Upload one chunk: obtain a write location, then write the bytes to it.
    ///
    /// Both steps are retried together, and every attempt writes the same
    /// buffer. When every attempt fails the error is
    /// [`TransferError::ChunkTransportFailed`]; permanent errors (such as an
    /// invalid session) are returned as they are.
    pub async fn upload_chunk(&self, request: &ChunkLocationRequest, data: Bytes) -> Result<()> {
        let operation = format!("chunk {} of {}", request.chunk_index, request.key);
        let gateway = &self.gateway;
        let result = with_retry(&self.retry, &operation, || {
            let data = data.clone();
            async move {
                let location = gateway.chunk_write_location(request).await?;
                gateway.put_chunk(&location, data).await
            }
        })
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    object_path = %request.key,
                    chunk = request.chunk_index,
                    bytes = data.len(),
                    "Chunk uploaded"
                );
                Ok(())
            }
            Err(Exhausted { attempts, error }) if error.is_retryable() => {
                Err(TransferError::ChunkTransportFailed {
                    object_path: request.key.clone(),
                    index: request.chunk_index,
                    attempts,
                    reason: error.to_string(),
                }
                .into())
            }
            Err(Exhausted { error, .. }) => Err(error),
        }
    }

    /// Compare a chunk read from disk with what storage recorded for it.
    ///
    /// A recorded chunk with a different fingerprint means the local file
    /// changed after it was uploaded; that is a
    /// [`TransferError::ResumeIntegrity`] and the chunk must not be re-sent.
    pub fn verify_resumed(unit: &TransferUnit, index: u32, data: &[u8]) -> Result<ResumeCheck> {
        let Some(recorded) = unit.uploaded_chunks().get(&index) else {
            return Ok(ResumeCheck::Pending);
        };
        // Object stores quote their etags
        if recorded.trim_matches('"') == chunk::fingerprint(data) {
            Ok(ResumeCheck::AlreadyUploaded)
        } else {
            Err(TransferError::ResumeIntegrity {
                local_path: unit.local_path().to_path_buf(),
                index,
            }
            .into())
        }
    }

    /// Open a read stream on `location`, retrying transient failures.
    pub async fn open_stream(&self, location: &str) -> Result<ReadStream> {
        with_retry(&self.retry, "download open", || {
            self.gateway.open_read(location)
        })
        .await
        .map_err(|exhausted| exhausted.error)
    }

    /// Stream an object into `dest`.
    ///
    /// Shorthand for [`ChunkTransport::open_stream`] followed by
    /// [`ChunkTransport::save_stream`].
    pub async fn download(
        &self,
        location: &str,
        dest: &Path,
        known_total: Option<u64>,
        event_tx: Option<&broadcast::Sender<Event>>,
    ) -> Result<u64> {
        let stream = self.open_stream(location).await?;
        self.save_stream(stream, dest, known_total, event_tx).await
    }

    /// Write an opened stream to `dest`.
    ///
    /// The total comes from the response headers, else from `known_total`;
    /// without either (or once more bytes than announced arrive) progress is
    /// reported as indeterminate. A failed stream removes the partial file.
    pub async fn save_stream(
        &self,
        stream: ReadStream,
        dest: &Path,
        known_total: Option<u64>,
        event_tx: Option<&broadcast::Sender<Event>>,
    ) -> Result<u64> {
        let total = stream.total_size.or(known_total);
        tracing::info!(
            path = %dest.display(),
            total_bytes = ?total,
            content_type = ?stream.content_type,
            "Download started"
        );

        match self
            .write_stream(stream.body, dest, total, event_tx)
            .await
        {
            Ok(bytes) => {
                if let Some(tx) = event_tx {
                    tx.send(Event::DownloadComplete {
                        path: dest.to_path_buf(),
                        bytes,
                    })
                    .ok();
                }
                tracing::info!(path = %dest.display(), bytes, "Download complete");
                Ok(bytes)
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(dest).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(
                        path = %dest.display(),
                        error = %remove_err,
                        "Failed to remove partial download"
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_stream(
        &self,
        mut body: futures::stream::BoxStream<'static, Result<Vec<u8>>>,
        dest: &Path,
        total: Option<u64>,
        event_tx: Option<&broadcast::Sender<Event>>,
    ) -> Result<u64> {
        let file = tokio::fs::File::create(dest).await?;
        let mut writer = tokio::io::BufWriter::with_capacity(self.download_buffer_size, file);
        let mut downloaded = 0u64;

        while let Some(bytes) = body.next().await {
            let bytes = bytes?;
            writer.write_all(&bytes).await?;
            downloaded += bytes.len() as u64;

            if let Some(tx) = event_tx {
                tx.send(Event::DownloadProgress {
                    path: dest.to_path_buf(),
                    downloaded,
                    total: total.filter(|t| downloaded <= *t),
                })
                .ok();
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(downloaded)
    }
}
