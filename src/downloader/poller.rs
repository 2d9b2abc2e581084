//! Polling of remote download preparation jobs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::{DownloadConfig, Zone};
use crate::error::{Error, Result};
use crate::services::MetadataService;
use crate::types::{DownloadJob, DownloadStatus, Event};

/// Waits for a preparation job to leave WAITING/RUNNING
#[derive(Clone)]
pub struct DownloadStatusPoller {
    metadata: Arc<dyn MetadataService>,
    poll_interval: Duration,
    max_wait: Option<Duration>,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl std::fmt::Debug for DownloadStatusPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStatusPoller")
            .field("poll_interval", &self.poll_interval)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl DownloadStatusPoller {
    /// Poller using the configured interval and wait bound.
    pub fn new(metadata: Arc<dyn MetadataService>, config: &DownloadConfig) -> Self {
        Self {
            metadata,
            poll_interval: config.poll_interval,
            max_wait: config.max_wait,
            event_tx: None,
        }
    }

    /// Emit [`Event::DownloadPreparing`] after each poll.
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Poll `hash_code` until the job succeeds.
    ///
    /// The status returned with the preparation handle is not trusted; the
    /// first decision comes from the first poll. FAILED ends with
    /// [`Error::DownloadFailed`] and is never retried. A job still pending
    /// after `max_wait` ends with [`Error::DownloadTimedOut`].
    pub async fn wait_until_ready(&self, zone: Zone, hash_code: &str) -> Result<DownloadJob> {
        let started = tokio::time::Instant::now();
        let mut polls = 0u32;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            let job = self.metadata.download_status(zone, hash_code).await?;
            polls += 1;
            tracing::debug!(hash_code, status = ?job.status, polls, "Download status");
            if let Some(tx) = &self.event_tx {
                tx.send(Event::DownloadPreparing {
                    hash_code: hash_code.to_string(),
                    status: job.status,
                })
                .ok();
            }

            match job.status {
                DownloadStatus::Succeed => {
                    tracing::info!(hash_code, polls, "Download ready");
                    return Ok(job);
                }
                DownloadStatus::Failed => {
                    tracing::error!(hash_code, polls, "Download preparation failed");
                    return Err(Error::DownloadFailed {
                        hash_code: hash_code.to_string(),
                    });
                }
                DownloadStatus::Waiting | DownloadStatus::Running => {}
            }

            if let Some(max_wait) = self.max_wait
                && started.elapsed() >= max_wait
            {
                return Err(Error::DownloadTimedOut {
                    hash_code: hash_code.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
        }
    }
}
