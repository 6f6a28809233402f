//! Caller-side retry for discovery runs.
//!
//! [`LookupOperation`](super::LookupOperation) never retries on its own.
//! Callers that want automatic retries wrap
//! [`DiscoveryManager::discover`](super::DiscoveryManager::discover) in
//! [`perform_with_retry`], which backs off exponentially and gives up on
//! rate limits and fatal errors.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::{DiscoveryError, Result};

/// Backoff settings for [`perform_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before retry number `failures` (1-based), without jitter.
    #[must_use]
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Returns the backoff delay plus up to 25% random jitter.
    #[must_use]
    pub fn jittered_delay(&self, failures: u32) -> Duration {
        let base = self.backoff_delay(failures);
        let spread = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }
}

/// Runs `op` until it succeeds, fails in a way retrying cannot fix, or the
/// attempts run out.
///
/// Rate limits are returned immediately so the caller can honor the
/// server's retry-after instant. Other errors carrying a retry-after hint
/// wait at least until that instant before the next attempt.
///
/// # Errors
///
/// Returns the last error from `op`.
pub async fn perform_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                failures += 1;
                if error.is_rate_limited() || !error.is_retryable() {
                    tracing::error!(error = %error, "Discovery failed; not retrying");
                    return Err(error);
                }
                if failures >= policy.max_attempts {
                    tracing::error!(error = %error, failures, "Discovery failed; giving up");
                    return Err(error);
                }

                let delay = retry_delay(policy, failures, &error, Utc::now());
                tracing::warn!(error = %error, ?delay, "Discovery failed; rescheduling");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Backoff for the next attempt, stretched to cover any server hint.
fn retry_delay(
    policy: &RetryPolicy,
    failures: u32,
    error: &DiscoveryError,
    now: DateTime<Utc>,
) -> Duration {
    let backoff = policy.jittered_delay(failures);
    error
        .retry_after()
        .and_then(|at| at.signed_duration_since(now).to_std().ok())
        .map_or(backoff, |hint| backoff.max(hint))
}
