//! Retry policies for venue calls and chain reads.
//!
//! Venue calls and chain reads fail for different reasons, so each gets its
//! own policy. [`NetworkRetryPolicy`] classifies HTTP statuses and leaves the
//! actual waiting to the shared [`RateLimiter`](crate::RateLimiter);
//! [`ChainReadRetryPolicy`] classifies provider errors and owns its backoff.

use std::time::Duration;

use crate::chain::ChainReadErrorKind;

/// Delay schedule between chain-read retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed { delay: Duration },
    /// `base * factor^retry`, capped at `max`. `jitter` spreads each delay by up to half.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let capped = (base.as_secs_f64() * factor.powi(exponent)).min(max.as_secs_f64());
                let delay = Duration::from_secs_f64(capped);
                if !jitter {
                    return delay;
                }

                // Uniform in [delay / 2, delay * 3 / 2].
                let half = delay / 2;
                let spread = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                half + Duration::from_millis(fastrand::u64(0..=spread))
            }
        }
    }
}

/// How a venue response status should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Venue is rate limiting this client; back off and try again.
    Throttled,
    /// Any other failure. Not retried.
    Terminal,
}

/// Retry policy for venue HTTP calls, keyed on the HTTP status taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Statuses that mean "throttled".
    pub throttle_statuses: Vec<u16>,
}

impl Default for NetworkRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            throttle_statuses: vec![403, 429],
        }
    }
}

impl NetworkRetryPolicy {
    pub fn classify(&self, status: u16) -> StatusClass {
        if (200..300).contains(&status) {
            StatusClass::Success
        } else if self.throttle_statuses.contains(&status) {
            StatusClass::Throttled
        } else {
            StatusClass::Terminal
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) was throttled.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Retry policy for chain reads, keyed on the provider error taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainReadRetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retry_on: Vec<ChainReadErrorKind>,
}

impl Default for ChainReadRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            retry_on: vec![
                ChainReadErrorKind::Timeout,
                ChainReadErrorKind::Transport,
                ChainReadErrorKind::ContractLogic,
            ],
        }
    }
}

impl ChainReadRetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, kind: ChainReadErrorKind, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries && self.retry_on.contains(&kind)
    }

    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.backoff.delay(retry)
    }
}
