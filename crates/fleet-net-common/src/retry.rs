//! Retry utilities with exponential backoff and jitter
//!
//! Two bounded loops are used by the reconcilers:
//!
//! * [`retry_on_transient`] retries a single write while the API server
//!   reports a timeout or throttling. Anything else, including a Conflict,
//!   surfaces immediately so the controller requeues with a fresh read.
//! * [`wait_until_deleted`] polls an object until it is gone.
//!
//! Both stop with [`Error::Cancelled`] as soon as the cancellation token fires.
//!
//! # Example
//!
//! ```ignore
//! use fleet_net_common::retry::{retry_on_transient, RetryConfig};
//!
//! let updated = retry_on_transient(
//!     &RetryConfig::transient_write(),
//!     &token,
//!     "update ServiceImport status",
//!     || async { store.update_status(&import).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Each delay is stretched by a random factor in `[1, 1 + jitter)`
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Backoff for individual API writes: 4 attempts from 10ms, factor 5, capped at 1s
    pub fn transient_write() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 5.0,
            jitter: 0.1,
        }
    }

    /// Backoff for confirming a delete: 5 polls from 500ms, factor 1.6, capped at 5s
    pub fn delete_confirmation() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.6,
            jitter: 0.2,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0..1.0 + self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Sleep for `delay`, or fail if the token fires first
async fn sleep_or_cancel(
    token: &CancellationToken,
    operation_name: &str,
    delay: Duration,
) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::cancelled(operation_name)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Errors rejected by `should_retry` are returned immediately. Otherwise the
/// operation is retried until it succeeds or `max_attempts` is exhausted, in
/// which case the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, P>(
    config: &RetryConfig,
    token: &CancellationToken,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        if token.is_cancelled() {
            return Err(Error::cancelled(operation_name));
        }
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if config.exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered_delay = config.jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                sleep_or_cancel(token, operation_name, jittered_delay).await?;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Retry an API call while it fails with Timeout, ServerTimeout or TooManyRequests
pub async fn retry_on_transient<F, Fut, T>(
    config: &RetryConfig,
    token: &CancellationToken,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff(config, token, operation_name, Error::is_transient, operation).await
}

/// Poll until an object is gone.
///
/// `get` reads the object: NotFound ends the wait successfully, success or a
/// transient error means it is still there, any other error fails the wait.
/// When the attempts run out, the last transient error is returned, or a
/// [`Error::Timeout`] if the object was simply still present.
pub async fn wait_until_deleted<F, Fut, T>(
    config: &RetryConfig,
    token: &CancellationToken,
    operation_name: &str,
    mut get: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;
    let mut last_err: Option<Error> = None;

    loop {
        if token.is_cancelled() {
            return Err(Error::cancelled(operation_name));
        }
        attempt += 1;

        match get().await {
            Err(e) if e.is_not_found() => return Ok(()),
            Ok(_) => {
                debug!(operation = %operation_name, attempt, "Object still present");
                last_err = None;
            }
            Err(e) if e.is_transient() => {
                debug!(operation = %operation_name, attempt, error = %e, "Transient error while waiting for deletion");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }

        if config.exhausted(attempt) {
            return Err(last_err.unwrap_or_else(|| {
                Error::timeout(operation_name, format!("still present after {attempt} checks"))
            }));
        }

        sleep_or_cancel(token, operation_name, config.jittered(delay)).await?;
        delay = config.next_delay(delay);
    }
}
