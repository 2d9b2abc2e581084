//! Common test utilities for pilot-transfer flow tests
//!
//! [`FakePlatform`] plays the metadata service and object storage in memory:
//! registered items, stored chunks per upload id, committed files and a
//! scripted download preparation job.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use pilot_transfer::chunk::fingerprint;
use pilot_transfer::services::{
    ChunkLocationRequest, FinalizeRequest, ItemState, MetadataService, PreRegisterRequest,
    PrepareDownloadRequest, ReadStream, RegisteredFile, RemoteChunkState, ResumeLookupRequest,
    StorageGateway,
};
use pilot_transfer::{
    ChunkTransport, Config, DownloadJob, DownloadStatus, Error, ItemStatus, Registration, Result,
    ServiceError, Zone,
};

#[derive(Clone, Debug)]
pub struct FakeItem {
    pub object_path: String,
    pub transfer_id: String,
    pub status: ItemStatus,
}

#[derive(Default)]
struct State {
    next_id: u32,
    items: BTreeMap<String, FakeItem>,
    parts: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    failing_chunks: HashSet<(String, u32)>,
    fail_finalize: bool,
    chunk_puts: usize,
    pre_register_calls: usize,
    finalize_calls: Vec<FinalizeRequest>,
    committed: HashMap<String, Vec<u8>>,
    statuses: VecDeque<DownloadStatus>,
    status_calls: usize,
    stream_calls: usize,
    download_body: Vec<u8>,
    download_file_path: Option<String>,
}

/// In-memory metadata service and object storage
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<State>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every put of `(object_path, index)` answers 503 until cleared
    pub fn fail_chunk(&self, object_path: &str, index: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_chunks
            .insert((object_path.to_string(), index));
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_chunks.clear();
        state.fail_finalize = false;
    }

    pub fn fail_finalize(&self) {
        self.state.lock().unwrap().fail_finalize = true;
    }

    /// Drop the stored parts of every upload, as if storage expired them
    pub fn forget_uploads(&self) {
        self.state.lock().unwrap().parts.clear();
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.lock().unwrap();
        state.chunk_puts = 0;
        state.pre_register_calls = 0;
        state.finalize_calls.clear();
        state.status_calls = 0;
        state.stream_calls = 0;
    }

    pub fn chunk_puts(&self) -> usize {
        self.state.lock().unwrap().chunk_puts
    }

    pub fn pre_register_calls(&self) -> usize {
        self.state.lock().unwrap().pre_register_calls
    }

    pub fn finalize_calls(&self) -> Vec<FinalizeRequest> {
        self.state.lock().unwrap().finalize_calls.clone()
    }

    pub fn item(&self, item_id: &str) -> Option<FakeItem> {
        self.state.lock().unwrap().items.get(item_id).cloned()
    }

    pub fn committed(&self, item_id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().committed.get(item_id).cloned()
    }

    /// Statuses returned by successive polls; the last one repeats
    pub fn script_download(
        &self,
        statuses: &[DownloadStatus],
        body: &[u8],
        file_path: Option<&str>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.statuses = statuses.iter().copied().collect();
        state.download_body = body.to_vec();
        state.download_file_path = file_path.map(str::to_string);
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }

    pub fn stream_calls(&self) -> usize {
        self.state.lock().unwrap().stream_calls
    }
}

#[async_trait]
impl MetadataService for FakePlatform {
    async fn pre_register(&self, request: &PreRegisterRequest) -> Result<Vec<RegisteredFile>> {
        let mut state = self.state.lock().unwrap();
        state.pre_register_calls += 1;
        let mut registered = Vec::new();
        for file in &request.files {
            state.next_id += 1;
            let n = state.next_id;
            let object_path = if file.relative_path.is_empty() {
                file.file_name.clone()
            } else {
                format!("{}/{}", file.relative_path, file.file_name)
            };
            let registration = Registration {
                transfer_id: format!("upload-{n}"),
                job_id: format!("job-{n}"),
                item_id: format!("item-{n}"),
            };
            state.items.insert(
                registration.item_id.clone(),
                FakeItem {
                    object_path: object_path.clone(),
                    transfer_id: registration.transfer_id.clone(),
                    status: ItemStatus::Registered,
                },
            );
            state
                .parts
                .insert(registration.transfer_id.clone(), BTreeMap::new());
            registered.push(RegisteredFile {
                object_path,
                registration,
            });
        }
        Ok(registered)
    }

    async fn resume_lookup(&self, request: &ResumeLookupRequest) -> Result<Vec<RemoteChunkState>> {
        let state = self.state.lock().unwrap();
        request
            .targets
            .iter()
            .map(|target| -> Result<RemoteChunkState> {
                let parts = state
                    .parts
                    .get(&target.transfer_id)
                    .ok_or(Error::Service(ServiceError::UploadIdNotExist))?;
                Ok(RemoteChunkState {
                    transfer_id: target.transfer_id.clone(),
                    chunks: parts
                        .iter()
                        .map(|(index, bytes)| (*index, format!("\"{}\"", fingerprint(bytes))))
                        .collect(),
                })
            })
            .collect()
    }

    async fn finalize(&self, request: &FinalizeRequest) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.finalize_calls.push(request.clone());
        if state.fail_finalize {
            return Err(Error::Http {
                operation: "finalize",
                status: 500,
                body: "combine failed".to_string(),
            });
        }

        let registration = &request.registration;
        let parts = state
            .parts
            .get(&registration.transfer_id)
            .ok_or(Error::Service(ServiceError::UploadIdNotExist))?;
        let mut content = Vec::new();
        for index in 1..=request.total_chunks {
            let part = parts.get(&index).ok_or_else(|| Error::Http {
                operation: "finalize",
                status: 400,
                body: format!("missing part {index}"),
            })?;
            content.extend_from_slice(part);
        }
        assert_eq!(content.len() as u64, request.total_size);

        let item_id = registration.item_id.clone();
        if let Some(item) = state.items.get_mut(&item_id) {
            item.status = ItemStatus::Active;
        }
        state.committed.insert(item_id.clone(), content);
        Ok(item_id)
    }

    async fn item_statuses(&self, item_ids: &[String]) -> Result<Vec<ItemState>> {
        let state = self.state.lock().unwrap();
        Ok(item_ids
            .iter()
            .filter_map(|id| {
                state.items.get(id).map(|item| ItemState {
                    item_id: id.clone(),
                    status: item.status,
                })
            })
            .collect())
    }

    async fn prepare_download(&self, _request: &PrepareDownloadRequest) -> Result<DownloadJob> {
        let state = self.state.lock().unwrap();
        Ok(DownloadJob {
            hash_code: "hash-1".to_string(),
            status: DownloadStatus::Waiting,
            total_size: Some(state.download_body.len() as u64),
            file_path: state.download_file_path.clone(),
        })
    }

    async fn download_status(&self, _zone: Zone, hash_code: &str) -> Result<DownloadJob> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        let status = if state.statuses.len() > 1 {
            state.statuses.pop_front().unwrap_or(DownloadStatus::Failed)
        } else {
            state.statuses.front().copied().unwrap_or(DownloadStatus::Failed)
        };
        Ok(DownloadJob {
            hash_code: hash_code.to_string(),
            status,
            total_size: Some(state.download_body.len() as u64),
            file_path: state.download_file_path.clone(),
        })
    }
}

#[async_trait]
impl StorageGateway for FakePlatform {
    async fn chunk_write_location(&self, request: &ChunkLocationRequest) -> Result<String> {
        Ok(format!(
            "{}|{}|{}",
            request.key, request.transfer_id, request.chunk_index
        ))
    }

    async fn put_chunk(&self, location: &str, data: Bytes) -> Result<()> {
        let mut fields = location.split('|');
        let key = fields.next().unwrap().to_string();
        let transfer_id = fields.next().unwrap().to_string();
        let index: u32 = fields.next().unwrap().parse().unwrap();

        let mut state = self.state.lock().unwrap();
        if state.failing_chunks.contains(&(key, index)) {
            return Err(Error::Http {
                operation: "chunk upload",
                status: 503,
                body: "slow down".to_string(),
            });
        }
        state.chunk_puts += 1;
        state
            .parts
            .entry(transfer_id)
            .or_default()
            .insert(index, data.to_vec());
        Ok(())
    }

    fn download_location(&self, _zone: Zone, hash_code: &str) -> String {
        format!("mem://download/{hash_code}")
    }

    async fn open_read(&self, _location: &str) -> Result<ReadStream> {
        let mut state = self.state.lock().unwrap();
        state.stream_calls += 1;
        let body = state.download_body.clone();
        let mid = body.len() / 2;
        let pieces = vec![Ok(body[..mid].to_vec()), Ok(body[mid..].to_vec())];
        Ok(ReadStream {
            total_size: Some(body.len() as u64),
            content_type: Some("application/octet-stream".to_string()),
            file_name: None,
            body: futures::stream::iter(pieces).boxed(),
        })
    }
}

/// Small chunks and near-instant retries and polls
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.transfer.chunk_size = 20;
    config.transfer.concurrency = 2;
    config.retry.max_attempts = 3;
    config.retry.interval = Duration::from_millis(1);
    config.download.poll_interval = Duration::from_millis(1);
    config
}

pub fn transport(platform: &Arc<FakePlatform>, config: &Config) -> ChunkTransport {
    ChunkTransport::new(platform.clone(), config.retry.clone())
}

/// Write `len` bytes of a repeating pattern to `dir/name`
pub fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, content).unwrap();
    path
}
