//! Retry policy: turn a classified failure into a `Decision`.
//!
//! ## Strategy
//!
//! Retry eligibility is decided by the *class* of the failure, not only by
//! how many attempts remain:
//!
//! | Class | Decision |
//! |-------|----------|
//! | `ClientError`, `MalformedResponse` | give up immediately |
//! | `RateLimited` | wait for the provider's `Retry-After`, else back off |
//! | `Connection`, `Timeout`, `ServerError` | exponential backoff + jitter |
//!
//! Backoff is `min(max_delay, base_delay · 2^(attempt−1))`; jitter adds a
//! uniform `[0, delay]` on top. With the defaults (500 ms base) the waits are
//! roughly 0.5 s → 1 s → 2 s before jitter.

use crate::config::RetryConfig;
use crate::error::ErrorClass;
use rand::Rng;
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Sleep this long, then try the same backend again.
    Retry(Duration),
    /// Stop trying this backend.
    GiveUp,
}

/// Per-backend retry policy.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide whether to retry after attempt number `attempt` (1-based)
    /// failed with `class`.
    ///
    /// Gives up once attempt `attempt + 1` would exceed `max_attempts`.
    pub fn decide(&self, class: &ErrorClass, attempt: u32) -> Decision {
        if attempt >= self.config.max_attempts {
            return Decision::GiveUp;
        }
        match class {
            ErrorClass::ClientError { .. } | ErrorClass::MalformedResponse => Decision::GiveUp,
            ErrorClass::RateLimited {
                retry_after: Some(hint),
            } => Decision::Retry(*hint),
            ErrorClass::RateLimited { retry_after: None }
            | ErrorClass::Connection
            | ErrorClass::Timeout
            | ErrorClass::ServerError { .. } => Decision::Retry(self.backoff(attempt)),
        }
    }

    /// Exponential delay for the retry following attempt `attempt`, jittered
    /// when the config asks for it.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_backoff(attempt);
        if self.config.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }

    /// `min(max_delay, base_delay · 2^(attempt−1))`, without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let millis = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_delay_ms);
        Duration::from_millis(millis)
    }
}
