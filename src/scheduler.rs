//! Bounded worker pool driving transfer units through their chunks
//!
//! Every unit gets a driver. The driver verifies chunks recorded by an
//! earlier run, spawns one task per chunk still missing and collects their
//! results; it is the only writer of the unit's chunk map. All chunk and
//! finalize work shares one pool of `concurrency` permits, and a chunk is read
//! from disk only once its permit is held. The token keep-alive runs beside
//! the pool and is stopped once every unit has finalized or failed.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinSet;

use crate::chunk;
use crate::config::{RetryConfig, Zone};
use crate::error::{Error, Result, TransferError};
use crate::keepalive::TokenKeepAlive;
use crate::retry::with_retry;
use crate::services::ChunkLocationRequest;
use crate::transport::{ChunkTransport, ResumeCheck};
use crate::types::Event;
use crate::unit::TransferUnit;

/// Buffered events before slow subscribers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Commits a unit once all of its chunks are stored
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Commit `unit`; returns the committed item id.
    async fn finalize(&self, unit: &TransferUnit) -> Result<String>;
}

/// Object-storage container the units upload into
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    /// Zone of the upload service
    pub zone: Zone,
    /// Bucket name
    pub bucket: String,
}

impl Container {
    /// Container of a project in a zone.
    pub fn for_project(zone: Zone, project_code: &str) -> Self {
        Self {
            zone,
            bucket: zone.bucket_for(project_code),
        }
    }
}

/// A unit that was committed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedUnit {
    /// Destination path
    pub object_path: String,
    /// Committed item id
    pub item_id: String,
}

/// A unit that failed, with its cause
#[derive(Debug)]
pub struct UnitFailure {
    /// Destination path
    pub object_path: String,
    /// Local source file
    pub local_path: PathBuf,
    /// Cause
    pub error: Error,
}

/// Outcome of a scheduler run
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Units committed
    pub completed: Vec<CompletedUnit>,
    /// Units that failed
    pub failed: Vec<UnitFailure>,
}

impl BatchReport {
    /// A batch fails only when nothing in it succeeded.
    pub fn is_success(&self) -> bool {
        !self.completed.is_empty() || self.failed.is_empty()
    }
}

/// Drives units through chunk transport and finalize
pub struct TransferScheduler {
    transport: ChunkTransport,
    container: Container,
    concurrency: usize,
    retry: RetryConfig,
    event_tx: broadcast::Sender<Event>,
    keepalive: Option<TokenKeepAlive>,
}

impl std::fmt::Debug for TransferScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferScheduler")
            .field("container", &self.container)
            .field("concurrency", &self.concurrency)
            .field("keepalive", &self.keepalive)
            .finish_non_exhaustive()
    }
}

impl TransferScheduler {
    /// Scheduler with `concurrency` workers (at least one).
    pub fn new(
        transport: ChunkTransport,
        container: Container,
        concurrency: usize,
        retry: RetryConfig,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            container,
            concurrency: concurrency.max(1),
            retry,
            event_tx,
            keepalive: None,
        }
    }

    /// Run `keepalive` for the duration of every [`TransferScheduler::run`].
    pub fn with_keepalive(mut self, keepalive: TokenKeepAlive) -> Self {
        self.keepalive = Some(keepalive.with_events(self.event_tx.clone()));
        self
    }

    /// Publish events on an existing channel instead of the scheduler's own.
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.keepalive = self.keepalive.map(|k| k.with_events(event_tx.clone()));
        self.event_tx = event_tx;
        self
    }

    /// Subscribe to progress and lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Number of workers
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Transfer every unit and finalize the ones whose chunks all arrived.
    ///
    /// Returns once every unit has finalized or failed. A failing unit never
    /// affects its siblings.
    pub async fn run(
        &self,
        units: Vec<TransferUnit>,
        finalizer: Arc<dyn Finalizer>,
    ) -> BatchReport {
        let pool = Arc::new(Semaphore::new(self.concurrency));
        let keepalive = self.keepalive.as_ref().map(TokenKeepAlive::start);
        tracing::info!(
            units = units.len(),
            concurrency = self.concurrency,
            bucket = %self.container.bucket,
            "Transfer batch started"
        );

        let outcomes = futures::future::join_all(
            units
                .into_iter()
                .map(|unit| self.drive_unit(unit, pool.clone(), finalizer.clone())),
        )
        .await;

        // Every unit has finished; the keep-alive is no longer needed
        if let Some(handle) = keepalive {
            handle.stop().await;
        }

        let mut report = BatchReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(completed) => report.completed.push(completed),
                Err(failure) => {
                    tracing::error!(
                        object_path = %failure.object_path,
                        error = %failure.error,
                        "Unit failed"
                    );
                    self.event_tx
                        .send(Event::UnitFailed {
                            object_path: failure.object_path.clone(),
                            error: failure.error.to_string(),
                        })
                        .ok();
                    report.failed.push(failure);
                }
            }
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "Transfer batch finished"
        );
        report
    }

    async fn drive_unit(
        &self,
        mut unit: TransferUnit,
        pool: Arc<Semaphore>,
        finalizer: Arc<dyn Finalizer>,
    ) -> std::result::Result<CompletedUnit, UnitFailure> {
        let fail = |unit: &TransferUnit, error: Error| UnitFailure {
            object_path: unit.object_path().to_string(),
            local_path: unit.local_path().to_path_buf(),
            error,
        };

        if let Err(e) = self.transfer_chunks(&mut unit, &pool).await {
            return Err(fail(&unit, e));
        }
        if !unit.is_complete() {
            let error = Error::Other(format!(
                "{} has {} of {} chunks after transfer",
                unit.object_path(),
                unit.uploaded_chunks().len(),
                unit.total_chunks()
            ));
            return Err(fail(&unit, error));
        }

        match self.finalize_unit(&unit, &pool, finalizer.as_ref()).await {
            Ok(item_id) => {
                tracing::info!(object_path = %unit.object_path(), item_id = %item_id, "Unit finalized");
                self.event_tx
                    .send(Event::UnitFinalized {
                        object_path: unit.object_path().to_string(),
                        item_id: item_id.clone(),
                    })
                    .ok();
                Ok(CompletedUnit {
                    object_path: unit.object_path().to_string(),
                    item_id,
                })
            }
            Err(e) => Err(fail(&unit, e)),
        }
    }

    /// Bring every chunk of `unit` into storage.
    async fn transfer_chunks(&self, unit: &mut TransferUnit, pool: &Arc<Semaphore>) -> Result<()> {
        if !unit.is_registered() {
            return Err(TransferError::NotRegistered {
                object_path: unit.object_path().to_string(),
            }
            .into());
        }

        let reader = unit.reader();
        let transferred = Arc::new(AtomicU64::new(0));

        // Chunks stored by an earlier run must still match before anything is sent
        let recorded: Vec<u32> = unit
            .uploaded_chunks()
            .keys()
            .copied()
            .filter(|i| (1..=unit.total_chunks()).contains(i))
            .collect();
        for index in recorded {
            let _permit = acquire(pool).await?;
            let data = reader.read(index).await?;
            if ChunkTransport::verify_resumed(unit, index, &data)? == ResumeCheck::AlreadyUploaded {
                let total = transferred.fetch_add(data.len() as u64, Ordering::Relaxed)
                    + data.len() as u64;
                self.emit_skipped(unit, index, total);
            }
        }

        let pending: Vec<u32> = (1..=unit.total_chunks())
            .filter(|i| !unit.uploaded_chunks().contains_key(i))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let aborted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut first_error: Option<Error> = None;

        for index in pending {
            let permit = acquire(pool).await?;
            if aborted.load(Ordering::SeqCst) {
                break;
            }
            let data = match reader.read(index).await {
                Ok(data) => data,
                Err(e) => {
                    first_error = Some(e.into());
                    break;
                }
            };
            let job = ChunkJob {
                transport: self.transport.clone(),
                request: ChunkLocationRequest {
                    zone: self.container.zone,
                    bucket: self.container.bucket.clone(),
                    key: unit.object_path().to_string(),
                    transfer_id: unit.transfer_id().to_string(),
                    chunk_index: index,
                },
                total_size: unit.total_size(),
                transferred: transferred.clone(),
                aborted: aborted.clone(),
                event_tx: self.event_tx.clone(),
            };
            tasks.spawn(job.run(data, permit));
        }

        // Single join point for the unit's chunk tasks
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, fingerprint))) => unit.record_chunk(index, fingerprint),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::Other(format!("chunk task failed: {e}")));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn finalize_unit(
        &self,
        unit: &TransferUnit,
        pool: &Arc<Semaphore>,
        finalizer: &dyn Finalizer,
    ) -> Result<String> {
        let _permit = acquire(pool).await?;
        let operation = format!("finalize {}", unit.object_path());
        with_retry(&self.retry, &operation, move || finalizer.finalize(unit))
            .await
            .map_err(|exhausted| {
                TransferError::FinalizeFailed {
                    object_path: unit.object_path().to_string(),
                    attempts: exhausted.attempts,
                    reason: exhausted.error.to_string(),
                }
                .into()
            })
    }

    fn emit_skipped(&self, unit: &TransferUnit, index: u32, transferred: u64) {
        tracing::debug!(object_path = %unit.object_path(), chunk = index, "Chunk already stored");
        self.event_tx
            .send(Event::ChunkSkipped {
                object_path: unit.object_path().to_string(),
                index,
            })
            .ok();
        self.event_tx
            .send(Event::UnitProgress {
                object_path: unit.object_path().to_string(),
                transferred,
                total: unit.total_size(),
            })
            .ok();
    }
}

async fn acquire(pool: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
    pool.clone()
        .acquire_owned()
        .await
        .map_err(|e| Error::Other(format!("worker pool closed: {e}")))
}

/// One spawned chunk upload
struct ChunkJob {
    transport: ChunkTransport,
    request: ChunkLocationRequest,
    total_size: u64,
    transferred: Arc<AtomicU64>,
    aborted: Arc<AtomicBool>,
    event_tx: broadcast::Sender<Event>,
}

impl ChunkJob {
    /// Upload `data` while holding `permit`; the buffer is dropped on return.
    async fn run(self, data: Vec<u8>, permit: OwnedSemaphorePermit) -> Result<(u32, String)> {
        let index = self.request.chunk_index;
        let data = Bytes::from(data);
        let result = self.transport.upload_chunk(&self.request, data.clone()).await;
        drop(permit);

        if let Err(e) = result {
            self.aborted.store(true, Ordering::SeqCst);
            return Err(e);
        }

        let bytes = data.len() as u64;
        let transferred = self.transferred.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.event_tx
            .send(Event::ChunkUploaded {
                object_path: self.request.key.clone(),
                index,
                bytes,
            })
            .ok();
        self.event_tx
            .send(Event::UnitProgress {
                object_path: self.request.key.clone(),
                transferred,
                total: self.total_size,
            })
            .ok();
        Ok((index, chunk::fingerprint(&data)))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::services::{IdentityService, ReadStream, StorageGateway, TokenPair};
    use crate::session::{Session, SessionParams};
    use crate::unit::Registration;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Gateway that records puts and tracks how many run at once
    #[derive(Default)]
    struct RecordingGateway {
        puts: Mutex<Vec<(String, u32)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_key: Option<String>,
        put_delay: Option<Duration>,
    }

    #[async_trait]
    impl StorageGateway for RecordingGateway {
        async fn chunk_write_location(&self, request: &ChunkLocationRequest) -> Result<String> {
            Ok(format!("{}#{}", request.key, request.chunk_index))
        }

        async fn put_chunk(&self, location: &str, _data: Bytes) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.put_delay.unwrap_or(Duration::from_millis(5))).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let (key, index) = location.split_once('#').unwrap();
            if self.fail_key.as_deref() == Some(key) {
                return Err(Error::Http {
                    operation: "chunk upload",
                    status: 500,
                    body: String::new(),
                });
            }
            self.puts
                .lock()
                .unwrap()
                .push((key.to_string(), index.parse().unwrap()));
            Ok(())
        }

        fn download_location(&self, _zone: Zone, hash_code: &str) -> String {
            hash_code.to_string()
        }

        async fn open_read(&self, _location: &str) -> Result<ReadStream> {
            unimplemented!("uploads only")
        }
    }

    /// Finalizer that records which chunks were stored when it ran
    struct CheckingFinalizer {
        gateway: Arc<RecordingGateway>,
        calls: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl Finalizer for CheckingFinalizer {
        async fn finalize(&self, unit: &TransferUnit) -> Result<String> {
            let stored = self
                .gateway
                .puts
                .lock()
                .unwrap()
                .iter()
                .filter(|(key, _)| key == unit.object_path())
                .count();
            self.calls
                .lock()
                .unwrap()
                .push((unit.object_path().to_string(), stored));
            Ok(format!("item-{}", unit.file_name()))
        }
    }

    fn registered_unit(dir: &std::path::Path, name: &str, len: usize) -> TransferUnit {
        let path = dir.join(name);
        std::fs::write(&path, vec![9u8; len]).unwrap();
        let mut unit = TransferUnit::new(&path, format!("alice/{name}"), 10).unwrap();
        unit.assign(Registration {
            transfer_id: format!("rid-{name}"),
            job_id: "job".to_string(),
            item_id: format!("item-{name}"),
        });
        unit
    }

    fn scheduler(gateway: Arc<RecordingGateway>, concurrency: usize) -> TransferScheduler {
        let retry = RetryConfig {
            max_attempts: 3,
            interval: Duration::from_millis(1),
            jitter: false,
        };
        TransferScheduler::new(
            ChunkTransport::new(gateway, retry.clone()),
            Container::for_project(Zone::Greenroom, "proj"),
            concurrency,
            retry,
        )
    }

    #[tokio::test]
    async fn finalize_runs_after_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(RecordingGateway::default());
        let finalizer = Arc::new(CheckingFinalizer {
            gateway: gateway.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let units = vec![
            registered_unit(dir.path(), "a.bin", 45),
            registered_unit(dir.path(), "b.bin", 25),
        ];

        let report = scheduler(gateway.clone(), 3).run(units, finalizer.clone()).await;

        assert!(report.failed.is_empty());
        assert_eq!(report.completed.len(), 2);
        let mut calls = finalizer.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(
            calls,
            vec![("alice/a.bin".to_string(), 5), ("alice/b.bin".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_chunk_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(RecordingGateway::default());
        let finalizer = Arc::new(CheckingFinalizer {
            gateway: gateway.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let units = (0..4)
            .map(|i| registered_unit(dir.path(), &format!("f{i}.bin"), 60))
            .collect();

        let report = scheduler(gateway.clone(), 2).run(units, finalizer).await;

        assert_eq!(report.completed.len(), 4);
        assert!(gateway.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(gateway.puts.lock().unwrap().len(), 24);
    }

    #[tokio::test]
    async fn failing_unit_does_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(RecordingGateway {
            fail_key: Some("alice/bad.bin".to_string()),
            ..Default::default()
        });
        let finalizer = Arc::new(CheckingFinalizer {
            gateway: gateway.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let units = vec![
            registered_unit(dir.path(), "bad.bin", 30),
            registered_unit(dir.path(), "good.bin", 30),
        ];

        let sched = scheduler(gateway.clone(), 2);
        let mut events = sched.subscribe();
        let report = sched.run(units, finalizer.clone()).await;

        assert!(report.is_success());
        assert_eq!(report.completed[0].object_path, "alice/good.bin");
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].error,
            Error::Transfer(TransferError::ChunkTransportFailed { .. })
        ));
        // The failed unit was never finalized
        assert_eq!(finalizer.calls.lock().unwrap().len(), 1);

        let failed_events = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, Event::UnitFailed { .. }))
            .count();
        assert_eq!(failed_events, 1);
    }

    #[tokio::test]
    async fn unregistered_unit_fails_without_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"data").unwrap();
        let unit = TransferUnit::new(&path, "alice/a.bin", 10).unwrap();
        let gateway = Arc::new(RecordingGateway::default());
        let finalizer = Arc::new(CheckingFinalizer {
            gateway: gateway.clone(),
            calls: Mutex::new(Vec::new()),
        });

        let report = scheduler(gateway.clone(), 1).run(vec![unit], finalizer).await;
        assert!(!report.is_success());
        assert!(matches!(
            report.failed[0].error,
            Error::Transfer(TransferError::NotRegistered { .. })
        ));
        assert!(gateway.puts.lock().unwrap().is_empty());
    }

    struct CountingIdentity {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl IdentityService for CountingIdentity {
        async fn refresh(&self, _client_id: &str, _refresh_token: &str) -> Result<TokenPair> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(TokenPair {
                access_token: "a".to_string(),
                refresh_token: "r".to_string(),
            })
        }
    }

    /// Finalizer that notes how many refreshes happened before it ran
    struct RefreshAwareFinalizer {
        identity: Arc<CountingIdentity>,
        refreshes_seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Finalizer for RefreshAwareFinalizer {
        async fn finalize(&self, unit: &TransferUnit) -> Result<String> {
            self.refreshes_seen
                .lock()
                .unwrap()
                .push(self.identity.refreshes.load(Ordering::SeqCst));
            Ok(format!("item-{}", unit.file_name()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_refreshes_during_run_and_stops_after_it() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(CountingIdentity {
            refreshes: AtomicUsize::new(0),
        });
        let session = Session::new(
            SessionParams {
                username: "alice".to_string(),
                session_id: "sid".to_string(),
                tokens: TokenPair {
                    access_token: "a0".to_string(),
                    refresh_token: "r0".to_string(),
                },
                client_id: "cli".to_string(),
                grace_window: Duration::from_secs(250),
            },
            identity.clone(),
        );
        // Three puts of 100s each span two 120s refresh intervals
        let gateway = Arc::new(RecordingGateway {
            put_delay: Some(Duration::from_secs(100)),
            ..Default::default()
        });
        let finalizer = Arc::new(RefreshAwareFinalizer {
            identity: identity.clone(),
            refreshes_seen: Mutex::new(Vec::new()),
        });
        let sched = scheduler(gateway.clone(), 1).with_keepalive(TokenKeepAlive::new(
            Arc::new(session),
            &TokenConfig::default(),
        ));
        let mut events = sched.subscribe();

        let report = sched
            .run(vec![registered_unit(dir.path(), "a.bin", 30)], finalizer.clone())
            .await;

        assert_eq!(report.completed.len(), 1);
        assert_eq!(gateway.puts.lock().unwrap().len(), 3);
        assert_eq!(*finalizer.refreshes_seen.lock().unwrap(), vec![2]);
        assert_eq!(identity.refreshes.load(Ordering::SeqCst), 2);

        let received: Vec<Event> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        let refreshed = received
            .iter()
            .filter(|e| matches!(e, Event::TokenRefreshed))
            .count();
        assert_eq!(refreshed, 2);

        // The finished signal was sent when run returned
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(identity.refreshes.load(Ordering::SeqCst), 2);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn empty_batch_is_success() {
        assert!(BatchReport::default().is_success());
    }
}
