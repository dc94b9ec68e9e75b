//! Retry with exponential backoff & jitter.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::Canceled;

/// An exponential backoff policy with jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Max number of retries after the initial attempt.
    pub retries: usize,
    /// The delay before the first retry.
    pub min_delay: Duration,
    /// The cap applied to every computed delay.
    pub max_delay: Duration,
    /// The multiplier applied per attempt.
    pub factor: f64,
    /// The relative jitter spread, `0.1` meaning ±10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(120),
            factor: 1.5,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Compute the jittered delay before the retry following the given
    /// zero-based attempt.
    pub fn delay(&self, attempt: usize) -> Duration {
        let base = self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let base = base.min(self.max_delay.as_secs_f64());
        let spread = 1.0 - self.jitter + 2.0 * self.jitter * rand::thread_rng().gen::<f64>();
        Duration::from_secs_f64((base * spread).max(0.0))
    }
}

/// Drive the given operation to completion under the given policy.
///
/// The `when` predicate receives each error together with the zero-based
/// attempt number and decides whether it is retryable; a non-retryable
/// error or an exhausted budget returns the last error as-is. Backoff
/// sleeps race the cancellation token and fail with [`Canceled`] when it
/// fires.
pub async fn retry<T, F, Fut, W>(policy: &RetryPolicy, cancel: &CancellationToken, when: W, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    W: Fn(&anyhow::Error, usize) -> bool,
{
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(output) => return Ok(output),
            Err(err) => err,
        };
        if attempt >= policy.retries || !when(&err, attempt) {
            return Err(err);
        }
        tracing::debug!(error = ?err, attempt, "retryable failure, backing off");
        tokio::select! {
            _ = cancel.cancelled() => return Err(Canceled.into()),
            _ = tokio::time::sleep(policy.delay(attempt)) => (),
        }
        attempt += 1;
    }
}
