// Bounded retry around a single request attempt.
//
// Shared, unmodified, by both backends -- this is the single source of
// retry-policy truth. Only the transient failure kinds (conflict, service
// unavailable, connection refused) are retried; everything else propagates
// on first occurrence.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::Error;

pub(crate) const DEFAULT_MAX_RETRIES: u32 = 5;
pub(crate) const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// How many times, and how often, to re-attempt a request that failed with
/// a transient error. Fixed for the client's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries on top of the initial attempt (total attempts = this + 1).
    pub max_retries: u32,
    /// Fixed sleep between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Run `op` up to `max_retries + 1` times.
///
/// A transient failure on a non-final attempt logs a warning and sleeps
/// `interval` before the next try; on the final attempt it logs at error
/// level and is returned unchanged so the caller sees the true root cause.
pub(crate) async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let num_attempts = policy.max_retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < num_attempts => {
                warn!("error contacting server: {e}; attempt {attempt} of {num_attempts}");
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    error!("error contacting server: {e}; attempt {attempt} of {num_attempts}");
                }
                return Err(e);
            }
        }
    }
}
