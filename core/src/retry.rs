//! Retry with exponential backoff
//!
//! Used by the host for envelope redelivery and for the subscribe / start
//! boot steps. Node code never retries.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::{sleep, Duration};

use crate::error::HostError;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 10000,
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            exponential_base: 2.0,
        }
    }

    /// Calculate delay for retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.base_delay_ms as f64 * self.exponential_base.powi(attempt as i32 - 1);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the retry
/// budget is spent. Returns the result together with the number of attempts.
pub async fn retry_async<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> (Result<T, HostError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HostError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if e.is_retryable() && attempt <= config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                sleep(delay).await;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
