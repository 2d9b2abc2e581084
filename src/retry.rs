//! Retry logic with linear backoff
//!
//! Chunk transport and finalize share one policy: a bounded number of
//! attempts, waiting `interval * n` after the n-th failure, with optional
//! jitter to spread out workers that failed together.
//!
//! # Example
//!
//! ```no_run
//! use pilot_transfer::retry::{IsRetryable, with_retry};
//! use pilot_transfer::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), pilot_transfer::retry::Exhausted<MyError>> {
//! let config = RetryConfig::default();
//! with_retry(&config, "example", || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, TransferError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (non-2xx from storage, connection reset, timeouts) return `true`.
/// Permanent failures (integrity mismatch, rejected credentials, bad input) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Any unexpected status on a chunk or finalize call is a transport failure
            Error::Http { .. } => true,
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::UnexpectedResponse { .. } => true,
            Error::Transfer(TransferError::ResumeIntegrity { .. }) => false,
            Error::Transfer(_) => false,
            Error::Service(_) => false,
            Error::Session(_) => false,
            Error::Config { .. } => false,
            Error::DownloadFailed { .. } | Error::DownloadTimedOut { .. } => false,
            Error::InvalidManifest { .. } | Error::DestinationExists { .. } => false,
            Error::Serialization(_) => false,
            Error::Zip(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// Outcome of a retried operation that ran out of attempts
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts actually made
    pub attempts: u32,
    /// The final error
    pub error: E,
}

/// Execute an async operation with linear backoff retry logic
///
/// Runs `operation` up to `config.max_attempts` times. After the n-th
/// retryable failure it waits `config.interval * n` before trying again.
/// A non-retryable error is returned immediately.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = operation_name,
                        attempts = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(config, attempt);
                tracing::warn!(
                    operation = operation_name,
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        operation = operation_name,
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(
                        operation = operation_name,
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                }
                return Err(Exhausted { attempts: attempt, error: e });
            }
        }
    }
}

/// Delay after the given (1-based) failed attempt
pub(crate) fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = config.interval.saturating_mul(attempt);
    if config.jitter {
        add_jitter(delay)
    } else {
        delay
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 50% of the delay.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=0.5);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
