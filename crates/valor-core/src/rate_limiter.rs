//! Shared pacing and circuit breaker for the quoting venue.
//!
//! One [`RateLimiter`] is shared (via `Arc`) by every caller of a venue. Slot
//! reservation happens under the lock, the wait itself happens outside it, so
//! concurrent callers queue behind each other instead of bursting together.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::{CancelSignal, Cancelled};

/// Minimum spacing override above a given expected concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTier {
    /// Applies when the expected concurrency is strictly greater than this.
    pub above: usize,
    pub min_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub min_delay: Duration,
    /// Backoff applied on the first failure after a success.
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub failure_threshold: u32,
    pub breaker_timeout: Duration,
    /// Ascending by `above`.
    pub load_tiers: Vec<LoadTier>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1_500),
            backoff_floor: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(120),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(500),
            failure_threshold: 5,
            breaker_timeout: Duration::from_secs(300),
            load_tiers: vec![
                LoadTier {
                    above: 5,
                    min_delay: Duration::from_secs(2),
                },
                LoadTier {
                    above: 10,
                    min_delay: Duration::from_secs(3),
                },
            ],
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("circuit breaker open, retry in {remaining:?}")]
    CircuitOpen { remaining: Duration },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Snapshot of the limiter for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterState {
    pub last_request_time: Option<Instant>,
    pub min_delay: Duration,
    pub backoff_delay: Duration,
    pub consecutive_failures: u32,
    pub circuit_breaker_triggered: bool,
    pub circuit_breaker_until: Option<Instant>,
}

impl RateLimiterState {
    fn initial(min_delay: Duration) -> Self {
        Self {
            last_request_time: None,
            min_delay,
            backoff_delay: Duration::ZERO,
            consecutive_failures: 0,
            circuit_breaker_triggered: false,
            circuit_breaker_until: None,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    inner: Mutex<RateLimiterState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let inner = Mutex::new(RateLimiterState::initial(config.min_delay));
        Self { config, inner }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Waits for the next request slot and returns how long it waited.
    ///
    /// Fails immediately with [`RateLimitError::CircuitOpen`] while the breaker
    /// is tripped.
    pub async fn wait_if_needed(&self, cancel: &CancelSignal) -> Result<Duration, RateLimitError> {
        cancel.check()?;
        let now = Instant::now();
        let slot = {
            let mut inner = self.inner.lock().expect("rate limiter lock is not poisoned");

            if inner.circuit_breaker_triggered {
                match inner.circuit_breaker_until {
                    Some(until) if now < until => {
                        return Err(RateLimitError::CircuitOpen {
                            remaining: until - now,
                        });
                    }
                    _ => {
                        info!("circuit breaker cooldown elapsed, closing");
                        inner.circuit_breaker_triggered = false;
                        inner.circuit_breaker_until = None;
                        inner.consecutive_failures = 0;
                    }
                }
            }

            let spacing = inner.min_delay + inner.backoff_delay;
            let slot = inner
                .last_request_time
                .map(|last| (last + spacing).max(now))
                .unwrap_or(now);
            inner.last_request_time = Some(slot);
            slot
        };

        let wait = slot.saturating_duration_since(now);
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter spacing wait");
            cancel.sleep(wait).await?;
        }
        Ok(wait)
    }

    /// Alias of [`RateLimiter::wait_if_needed`].
    pub async fn acquire(&self, cancel: &CancelSignal) -> Result<Duration, RateLimitError> {
        self.wait_if_needed(cancel).await
    }

    /// Escalates the backoff, sleeps it off and returns the slept duration.
    pub async fn record_failure(&self, cancel: &CancelSignal) -> Result<Duration, Cancelled> {
        let delay = {
            let mut inner = self.inner.lock().expect("rate limiter lock is not poisoned");

            inner.backoff_delay = if inner.backoff_delay.is_zero() {
                self.config.backoff_floor
            } else {
                (inner.backoff_delay * 2).min(self.config.backoff_cap)
            };
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

            if inner.consecutive_failures >= self.config.failure_threshold
                && !inner.circuit_breaker_triggered
            {
                let until = Instant::now() + self.config.breaker_timeout;
                inner.circuit_breaker_triggered = true;
                inner.circuit_breaker_until = Some(until);
                warn!(
                    failures = inner.consecutive_failures,
                    cooldown_secs = self.config.breaker_timeout.as_secs(),
                    "circuit breaker tripped"
                );
            }

            let delay = inner.backoff_delay + self.jitter();
            warn!(
                failures = inner.consecutive_failures,
                backoff_ms = delay.as_millis() as u64,
                "venue throttled request, backing off"
            );
            delay
        };

        cancel.sleep(delay).await?;
        Ok(delay)
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("rate limiter lock is not poisoned");
        inner.backoff_delay = Duration::ZERO;
        inner.consecutive_failures = 0;
        inner.circuit_breaker_triggered = false;
        inner.circuit_breaker_until = None;
    }

    /// Raises the minimum spacing in coarse tiers as expected concurrency grows.
    pub fn adjust_for_load(&self, concurrency: usize) -> Duration {
        let min_delay = self
            .config
            .load_tiers
            .iter()
            .filter(|tier| concurrency > tier.above)
            .map(|tier| tier.min_delay)
            .last()
            .unwrap_or(self.config.min_delay);

        let mut inner = self.inner.lock().expect("rate limiter lock is not poisoned");
        if inner.min_delay != min_delay {
            debug!(
                concurrency,
                min_delay_ms = min_delay.as_millis() as u64,
                "adjusted rate limiter for load"
            );
        }
        inner.min_delay = min_delay;
        min_delay
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("rate limiter lock is not poisoned");
        *inner = RateLimiterState::initial(self.config.min_delay);
    }

    pub fn status(&self) -> RateLimiterState {
        *self.inner.lock().expect("rate limiter lock is not poisoned")
    }

    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().expect("rate limiter lock is not poisoned");
        inner.circuit_breaker_triggered
            && inner
                .circuit_breaker_until
                .is_some_and(|until| Instant::now() < until)
    }

    fn jitter(&self) -> Duration {
        let low = self.config.jitter_min.as_millis() as u64;
        let high = (self.config.jitter_max.as_millis() as u64).max(low);
        Duration::from_millis(fastrand::u64(low..=high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> RateLimiterConfig {
        RateLimiterConfig {
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
            ..RateLimiterConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_is_immediate_then_spaced() {
        let limiter = RateLimiter::new(quiet_config());
        let cancel = CancelSignal::new();

        assert_eq!(limiter.wait_if_needed(&cancel).await, Ok(Duration::ZERO));
        let waited = limiter.wait_if_needed(&cancel).await.expect("slot");
        assert_eq!(waited, Duration::from_millis(1_500));
    }
}
