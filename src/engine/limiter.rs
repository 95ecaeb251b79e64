//! Rate limiting for provider calls.
//!
//! One budget per (scope, resource kind), shared by every query in the
//! process. Each budget is a GCRA cell: a single atomic "theoretical arrival
//! time", which is equivalent to a token bucket with `burst` capacity and a
//! `requests_per_second` refill. Tokens are taken with a CAS loop; the budget
//! map lock is only held to find or create a budget.

use crate::config::RateLimitConfig;
use crate::error::HydrateError;
use crate::scope::ResourceScope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

type BudgetKey = (ResourceScope, String);

/// Proof that a call was admitted by the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateToken {
    /// Time spent waiting for the token
    pub waited: Duration,
}

#[derive(Debug)]
struct Budget {
    /// Theoretical arrival time in nanoseconds since the limiter origin
    tat: AtomicU64,
}

impl Budget {
    fn new() -> Self {
        Self {
            tat: AtomicU64::new(0),
        }
    }

    /// Take one token at `now`, or report how long until one is available
    fn try_take(&self, now: u64, interval: u64, tolerance: u64) -> Result<(), Duration> {
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let allow_at = tat.saturating_sub(tolerance);
            if now < allow_at {
                return Err(Duration::from_nanos(allow_at - now));
            }
            let next = tat.max(now).saturating_add(interval);
            match self
                .tat
                .compare_exchange_weak(tat, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => tat = actual,
            }
        }
    }

    fn available(&self, now: u64, interval: u64, tolerance: u64) -> u64 {
        let tat = self.tat.load(Ordering::Acquire);
        now.saturating_add(tolerance)
            .saturating_add(interval)
            .saturating_sub(tat.max(now))
            / interval
    }
}

/// Process-wide limiter over all (scope, resource kind) budgets
#[derive(Debug)]
pub struct RateLimiter {
    /// Nanoseconds between refilled tokens
    interval: u64,
    /// How far ahead of schedule a burst may run
    tolerance: u64,
    burst: u32,
    acquire_timeout: Duration,
    origin: Instant,
    budgets: RwLock<HashMap<BudgetKey, Arc<Budget>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            interval: config.interval_nanos(),
            // Saturates for windows `Config::validate` rejects
            tolerance: config.burst_tolerance_nanos().unwrap_or(u64::MAX),
            burst: config.burst.max(1),
            acquire_timeout: config.acquire_timeout(),
            origin: Instant::now(),
            budgets: RwLock::new(HashMap::new()),
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn budget(&self, scope: &ResourceScope, kind: &str) -> Arc<Budget> {
        let key = (scope.clone(), kind.to_string());
        {
            let budgets = self.budgets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(budget) = budgets.get(&key) {
                return budget.clone();
            }
        }
        let mut budgets = self.budgets.write().unwrap_or_else(|e| e.into_inner());
        budgets
            .entry(key)
            .or_insert_with(|| Arc::new(Budget::new()))
            .clone()
    }

    /// Wait for a token for `(scope, kind)`.
    ///
    /// Only the calling task is suspended. Fails with `RateLimitTimeout` once
    /// the acquire timeout has elapsed without a token.
    pub async fn acquire(
        &self,
        scope: &ResourceScope,
        kind: &str,
    ) -> Result<RateToken, HydrateError> {
        let budget = self.budget(scope, kind);
        let start = Instant::now();
        let deadline = start + self.acquire_timeout;

        loop {
            let wait = match budget.try_take(self.now(), self.interval, self.tolerance) {
                Ok(()) => {
                    return Ok(RateToken {
                        waited: start.elapsed(),
                    })
                }
                Err(wait) => wait,
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("Rate limit timeout for {} on {}", kind, scope);
                return Err(HydrateError::RateLimitTimeout {
                    waited: start.elapsed(),
                });
            }

            tracing::trace!("Waiting {:?} for a {} token on {}", wait, kind, scope);
            tokio::time::sleep_until((now + wait).min(deadline)).await;
        }
    }

    /// Tokens currently available for `(scope, kind)`; between 0 and `burst`
    pub fn available(&self, scope: &ResourceScope, kind: &str) -> u32 {
        let budget = self.budget(scope, kind);
        let tokens = budget.available(self.now(), self.interval, self.tolerance);
        u32::try_from(tokens).unwrap_or(u32::MAX).min(self.burst)
    }
}
