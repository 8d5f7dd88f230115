//! Retry with exponential backoff and full jitter.
//!
//! `delay = min(base * 2^attempt, cap) * rand(0, 1)`, overridden by the
//! provider's retry-after hint on rate limits. Only retriable errors are
//! retried; permanent errors surface immediately.

use super::provider::{ProviderError, ProviderResult};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retrying after the given zero-based attempt.
    ///
    /// Honors `retry_after` when the provider supplied one; otherwise full
    /// jitter over the capped exponential.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.cap);
        }
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        exp.mul_f64(rand::rng().random_range(0.0..1.0))
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or
/// is cancelled. Returns the last error on exhaustion.
///
/// `on_attempt_error` fires once per failed call with the zero-based
/// attempt index, letting callers record an Attempt per provider call.
pub async fn retry_with_backoff<T, F, Fut, E>(
    mut op: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut on_attempt_error: E,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
    E: FnMut(u32, &ProviderError),
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        on_attempt_error(attempt, &err);

        if !err.is_retriable() {
            return Err(err);
        }
        attempt += 1;
        if attempt >= config.max_attempts {
            tracing::warn!(attempts = attempt, error = %err, "retry budget exhausted");
            return Err(err);
        }

        let delay = config.delay_for(attempt - 1, err.retry_after());
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "backing off before retry"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        }
    }
}
