//! Exponential backoff for adapter calls.
//!
//! Retry is an adapter concern: only the adapter knows which of its failures
//! are transient.  The job manager never re-submits on its own.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::providers::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2,
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `retry` (1-based): `base * factor^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    fn delay_with_hint(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let computed = self.delay_for(retry);
        match hint {
            Some(hint) => computed.max(hint).min(self.max_delay),
            None => computed,
        }
    }
}

/// Run `call` until it succeeds, fails with a non-retryable kind, or the
/// policy's attempt budget is spent.  The last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_with_hint(attempt, err.retry_after);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    kind = %err.kind,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message,
                    "provider call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
