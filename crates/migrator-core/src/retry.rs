//! Bounded retry for point queries.
//!
//! Upload counts, size lookups, listing pages and ownership scans are retried
//! on the transient error class ([`MigrationError::is_retryable`]); every other
//! failure propagates at once. Step executors are never retried here: a failed
//! step is classified and the upload is picked up again on a later run.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryDefaults;
use crate::error::Result;

/// Doubling backoff, capped, with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RetryDefaults::MAX_ATTEMPTS,
            base_delay: RetryDefaults::BASE_DELAY,
            max_delay: RetryDefaults::MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// The default point-query policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt budget, first attempt included. At least 1.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the delay before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Enable or disable delay jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sleep before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let doubled = self.base_delay.saturating_mul(1u32 << retry.min(20));
        let capped = doubled.min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        capped.mul_f64(factor).min(self.max_delay)
    }
}

/// Run `operation`, retrying transient failures. `what` names it in the logs.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!("{} succeeded after {} retries", what, retry);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && retry + 1 < attempts => {
                let delay = config.delay_for(retry);
                warn!(
                    "{} failed ({}); retry {}/{} in {:?}",
                    what,
                    e,
                    retry + 1,
                    attempts - 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!("{} gave up after {} attempts: {}", what, attempts, e);
                }
                return Err(e);
            }
        }
    }
}
