//! Retry policy with exponential backoff
//!
//! `Transient` and `Throttled` failures are retried with a growing, jittered
//! delay. A provider `Retry-After` hint is a floor for the next delay, and
//! delays never shrink from one retry to the next.

use crate::config::RetryConfig;
use crate::error::{CallFailure, HydrateError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff parameters for one kind of call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Jitter factor in [0.0, 1.0]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based), capped at `max_delay`
    #[allow(clippy::cast_precision_loss)]
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry number `retry`, given the previous delay and an
    /// optional provider hint. `random` is a sample in [0.0, 1.0).
    #[allow(clippy::cast_precision_loss)]
    pub fn delay_with(
        &self,
        retry: u32,
        previous: Duration,
        hint: Option<Duration>,
        random: f64,
    ) -> Duration {
        let base = self.base_delay_for(retry);
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * random.clamp(0.0, 1.0);
        let jittered = Duration::from_millis((base.as_millis() as f64 * factor).max(0.0) as u64)
            .min(self.max_delay);

        // The hint may exceed max_delay; the provider wins.
        jittered.max(previous).max(hint.unwrap_or(Duration::ZERO))
    }

    pub fn next_delay(&self, retry: u32, previous: Duration, hint: Option<Duration>) -> Duration {
        self.delay_with(retry, previous, hint, fastrand::f64())
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. `op` receives the 1-based attempt number.
///
/// Cancellation is observed while sleeping between attempts; the last
/// error is returned and the caller is expected to check the token.
pub async fn retry_call<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, CallFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HydrateError>>,
{
    let mut previous = Duration::ZERO;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() || attempt >= policy.max_attempts {
            return Err(CallFailure::new(error, attempt));
        }

        let delay = policy.next_delay(attempt, previous, error.retry_after());
        previous = delay;
        tracing::debug!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempt,
            error.kind(),
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(CallFailure::new(error, attempt)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
