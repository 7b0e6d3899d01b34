//! Retry policy shared by all feed sources
//!
//! Transient failures are retried with exponential backoff. A malformed
//! response gets exactly one immediate second attempt, since a truncated
//! body is often a one-off.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_retries: usize,
}

impl Backoff {
    /// Create a policy
    pub fn new(base: Duration, max: Duration, max_retries: usize) -> Self {
        Self {
            base,
            max,
            max_retries,
        }
    }

    /// Policy from engine settings
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.max_retries,
        )
    }

    /// Policy that never waits (tests)
    pub fn immediate(max_retries: usize) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, max_retries)
    }

    /// Wait before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31) as u32).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds or the policy gives up
    ///
    /// Exhausted transient failures come back as [`Error::TransientFetch`];
    /// a second malformed response is returned as-is.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut transient_failures = 0usize;
        let mut malformed_retried = false;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if transient_failures >= self.max_retries {
                        warn!(what, attempts = transient_failures + 1, error = %e, "Giving up after retries");
                        return Err(Error::transient(format!(
                            "{}: {} attempts failed, last error: {}",
                            what,
                            transient_failures + 1,
                            e
                        )));
                    }
                    let delay = self.delay(transient_failures);
                    transient_failures += 1;
                    warn!(what, attempt = transient_failures, ?delay, error = %e, "Transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e @ Error::MalformedResponse(_)) if !malformed_retried => {
                    debug!(what, error = %e, "Malformed response, retrying once");
                    malformed_retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
