//! Background access-token refresh for long transfers
//!
//! The keep-alive wakes on a fixed tick, accumulates elapsed time and
//! refreshes the session once the refresh interval is reached. It shares one
//! cancellation token with its owner; cancelling it is the "finished" signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TokenConfig;
use crate::session::Session;
use crate::types::Event;

/// Periodic token refresher
#[derive(Clone)]
pub struct TokenKeepAlive {
    session: Arc<Session>,
    tick: Duration,
    refresh_interval: Duration,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl std::fmt::Debug for TokenKeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenKeepAlive")
            .field("tick", &self.tick)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

/// Running keep-alive task
#[derive(Debug)]
pub struct KeepAliveHandle {
    cancel: CancellationToken,
    task: JoinHandle<u32>,
}

impl TokenKeepAlive {
    /// Keep-alive for `session` using the configured tick and refresh interval.
    pub fn new(session: Arc<Session>, config: &TokenConfig) -> Self {
        Self {
            session,
            tick: config.tick,
            refresh_interval: config.refresh_interval,
            event_tx: None,
        }
    }

    /// Emit [`Event::TokenRefreshed`] on `event_tx` after each refresh.
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Spawn the refresh loop.
    pub fn start(&self) -> KeepAliveHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.clone(), cancel.clone()));
        KeepAliveHandle { cancel, task }
    }
}

impl KeepAliveHandle {
    /// Send the finished signal and wait for the loop to exit.
    ///
    /// Consumes the handle, so the loop is stopped exactly once. Returns the
    /// number of refreshes performed.
    pub async fn stop(self) -> u32 {
        self.cancel.cancel();
        match self.task.await {
            Ok(refreshes) => refreshes,
            Err(e) => {
                tracing::error!(error = %e, "Token keep-alive task panicked");
                0
            }
        }
    }
}

async fn run_loop(keepalive: TokenKeepAlive, cancel: CancellationToken) -> u32 {
    let start = tokio::time::Instant::now() + keepalive.tick;
    let mut interval = tokio::time::interval_at(start, keepalive.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut elapsed = Duration::ZERO;
    let mut refreshes = 0u32;
    tracing::debug!(
        tick_secs = keepalive.tick.as_secs(),
        interval_secs = keepalive.refresh_interval.as_secs(),
        "Token keep-alive started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                elapsed += keepalive.tick;
                if elapsed < keepalive.refresh_interval || cancel.is_cancelled() {
                    continue;
                }
                elapsed = Duration::ZERO;
                match keepalive.session.refresh().await {
                    Ok(()) => {
                        refreshes += 1;
                        if let Some(tx) = &keepalive.event_tx {
                            tx.send(Event::TokenRefreshed).ok();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Background token refresh failed");
                    }
                }
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }

    tracing::debug!(refreshes, "Token keep-alive stopped");
    refreshes
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SessionError};
    use crate::services::{IdentityService, TokenPair};
    use crate::session::SessionParams;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Identity {
        calls: AtomicU32,
        fail: AtomicBool,
    }

    #[async_trait]
    impl IdentityService for Identity {
        async fn refresh(&self, _client_id: &str, _refresh_token: &str) -> Result<TokenPair> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SessionError::RefreshFailed {
                    status: 500,
                    body: "down".to_string(),
                }
                .into());
            }
            Ok(TokenPair {
                access_token: "a".to_string(),
                refresh_token: "r".to_string(),
            })
        }
    }

    fn keepalive(fail: bool) -> (TokenKeepAlive, Arc<Identity>) {
        let identity = Arc::new(Identity {
            calls: AtomicU32::new(0),
            fail: AtomicBool::new(fail),
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
        (
            TokenKeepAlive::new(Arc::new(session), &TokenConfig::default()),
            identity,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_once_per_interval() {
        let (keepalive, identity) = keepalive(false);
        let (tx, mut rx) = broadcast::channel(16);
        let handle = keepalive.with_events(tx).start();

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(identity.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(131)).await;
        assert_eq!(handle.stop().await, 2);
        assert_eq!(identity.calls.load(Ordering::SeqCst), 2);
        assert_eq!(rx.try_recv().unwrap(), Event::TokenRefreshed);
    }

    #[tokio::test(start_paused = true)]
    async fn no_refresh_after_finished_signal() {
        let (keepalive, identity) = keepalive(false);
        let handle = keepalive.start();

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(handle.stop().await, 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(identity.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failures_are_not_fatal() {
        let (keepalive, identity) = keepalive(true);
        let handle = keepalive.start();

        tokio::time::sleep(Duration::from_secs(250)).await;
        assert_eq!(handle.stop().await, 0);
        // Both attempts were made; the loop kept running after the first failure
        assert_eq!(identity.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_tick() {
        let (keepalive, identity) = keepalive(false);
        let handle = keepalive.start();
        assert_eq!(handle.stop().await, 0);
        assert_eq!(identity.calls.load(Ordering::SeqCst), 0);
    }
}
