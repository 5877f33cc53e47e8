use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff parameters for batch processing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Randomization factor in `[0, 1)` applied to each interval.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// The consumer defaults: 35 retries starting at 5s with a 1.25
    /// multiplier work out to roughly 13 hours, capped at 12.
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            multiplier: 1.25,
            max_interval: Duration::from_secs(30 * 60),
            max_elapsed: Duration::from_secs(12 * 60 * 60),
            max_retries: 35,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff interval to sleep before retry `n` (1-based), without jitter.
    pub fn interval_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let scaled = self.initial_interval.mul_f64(factor);
        scaled.min(self.max_interval)
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return interval;
        }
        let spread = interval.mul_f64(self.jitter);
        let low = interval.saturating_sub(spread);
        let high = interval + spread;
        let t: f64 = rand::random();
        low + (high - low).mul_f64(t)
    }
}

/// Classification of an attempt failure. `Permanent` short-circuits the
/// remaining retries.
#[derive(Debug)]
pub enum RetryError {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

impl RetryError {
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            RetryError::Transient(e) | RetryError::Permanent(e) => e,
        }
    }
}

/// Run `op` until it succeeds, the policy is exhausted, a permanent error is
/// returned, or `token` is cancelled. Cancellation aborts inside the backoff
/// sleep and surfaces the last attempt error.
pub async fn retry<F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RetryError>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(()) => return Ok(()),
            Err(RetryError::Permanent(e)) => return Err(e),
            Err(RetryError::Transient(e)) => e,
        };

        let retries_done = attempt - 1;
        if retries_done >= policy.max_retries {
            return Err(err.context(format!("giving up after {attempt} attempts")));
        }

        let interval = policy.jittered(policy.interval_for(retries_done + 1));
        if started.elapsed() + interval > policy.max_elapsed {
            return Err(err.context("retry window elapsed"));
        }

        debug!(
            attempt,
            backoff_ms = interval.as_millis() as u64,
            error = %err,
            "attempt failed, backing off"
        );

        tokio::select! {
            () = token.cancelled() => {
                return Err(err.context("cancelled during retry backoff"));
            }
            () = tokio::time::sleep(interval) => {}
        }
    }
}
