//! Provides backoff timing control for retried registry operations
//! such as fetching an image configuration or downloading a layer.
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::PullError;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// A `BackoffStrategy` in which the durations increase exponentially
/// until hitting a cap.
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// Gets the backoff used between image configuration fetches.
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(30))
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy starting at `base_duration` and never exceeding `cap`.
    pub fn new(base_duration: Duration, cap: Duration) -> Self {
        Self {
            base_duration,
            cap,
            last_duration: Duration::from_secs(0),
        }
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// `on_retry` is told about every failure that will be retried and how long
/// the wait before the next attempt is. Cancellation is observed while
/// waiting.
pub async fn retry<T, F, Fut, N>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut op: F,
    mut on_retry: N,
) -> Result<T, PullError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PullError>>,
    N: FnMut(&PullError, Duration),
{
    let mut backoff = policy.backoff();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !err.is_retryable() || attempt >= policy.attempts {
            return Err(err);
        }
        let wait = backoff.next_duration();
        debug!(error = %err, attempt, ?wait, "Operation failed, retrying");
        on_retry(&err, wait);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PullError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
