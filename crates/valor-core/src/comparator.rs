//! Multi-backend comparison under a shared per-minute cost budget.
//!
//! Every backend the routing venue exposes has a fixed cost in the venue's
//! rate-limit units, billed per attempt. A comparison is one "batch": each
//! backend is queried in turn, spaced apart, and the strictly greatest
//! `amount_out` wins.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::{CancelSignal, Cancelled};
use crate::routing_client::{RouteQuote, RouteRequest, RouteSource, RoutingError};

/// A routing backend and its cost per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub cost: u32,
}

impl Backend {
    pub fn new(name: impl Into<String>, cost: u32) -> Self {
        Self {
            name: name.into(),
            cost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparatorConfig {
    /// Queried in this order; earlier backends win ties.
    pub backends: Vec<Backend>,
    pub budget_per_window: u32,
    pub window: Duration,
    pub call_spacing: Duration,
    pub batch_spacing: Duration,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            backends: vec![
                Backend::new("kyberswap", 5),
                Backend::new("odos", 15),
                Backend::new("paraswap", 15),
            ],
            budget_per_window: 100,
            window: Duration::from_secs(60),
            call_spacing: Duration::from_secs(2),
            batch_spacing: Duration::from_secs(20),
        }
    }
}

impl ComparatorConfig {
    pub fn batch_cost(&self) -> u32 {
        self.backends.iter().map(|backend| backend.cost).sum()
    }
}

/// Outcome of one backend within one comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorCandidate {
    pub backend: String,
    pub cost: u32,
    pub result: Result<RouteQuote, RoutingError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub winner: String,
    pub quote: RouteQuote,
    pub candidates: Vec<AggregatorCandidate>,
    pub cost_charged: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComparatorError {
    #[error("all {} backends failed: {}", .candidates.len(), summarize(.candidates))]
    AllBackendsFailed {
        candidates: Vec<AggregatorCandidate>,
        cost_charged: u32,
    },
    #[error("no backends configured")]
    NoBackends,
    #[error("batch cost {cost} exceeds the per-window budget of {budget}")]
    BatchExceedsBudget { cost: u32, budget: u32 },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

fn summarize(candidates: &[AggregatorCandidate]) -> String {
    candidates
        .iter()
        .filter_map(|candidate| {
            candidate
                .result
                .as_ref()
                .err()
                .map(|error| format!("{}: {error}", candidate.backend))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Default)]
struct BudgetState {
    window_start: Option<Instant>,
    spent: u32,
    last_batch: Option<Instant>,
}

/// Fixed-window cost accounting with minimum spacing between batches.
#[derive(Debug)]
pub struct CostBudget {
    cap: u32,
    window: Duration,
    batch_spacing: Duration,
    inner: Mutex<BudgetState>,
}

impl CostBudget {
    pub fn new(cap: u32, window: Duration, batch_spacing: Duration) -> Self {
        Self {
            cap,
            window,
            batch_spacing,
            inner: Mutex::new(BudgetState::default()),
        }
    }

    /// Waits until a batch costing `cost` fits, then charges it.
    pub async fn reserve(&self, cost: u32, cancel: &CancelSignal) -> Result<(), ComparatorError> {
        if cost > self.cap {
            return Err(ComparatorError::BatchExceedsBudget {
                cost,
                budget: self.cap,
            });
        }

        loop {
            let wait = self.try_reserve(cost, Instant::now());
            match wait {
                None => return Ok(()),
                Some(wait) => {
                    info!(
                        wait_ms = wait.as_millis() as u64,
                        cost, "waiting for routing budget"
                    );
                    cancel.sleep(wait).await?;
                }
            }
        }
    }

    /// Units spent in the current window.
    pub fn spent(&self) -> u32 {
        self.inner
            .lock()
            .expect("cost budget lock is not poisoned")
            .spent
    }

    fn try_reserve(&self, cost: u32, now: Instant) -> Option<Duration> {
        let mut inner = self.inner.lock().expect("cost budget lock is not poisoned");

        let window_start = *inner.window_start.get_or_insert(now);
        if now.saturating_duration_since(window_start) >= self.window {
            inner.window_start = Some(now);
            inner.spent = 0;
        }

        if let Some(last_batch) = inner.last_batch {
            let ready = last_batch + self.batch_spacing;
            if now < ready {
                return Some(ready - now);
            }
        }

        if inner.spent + cost > self.cap {
            let rollover = inner.window_start.unwrap_or(now) + self.window;
            return Some(rollover.saturating_duration_since(now).max(Duration::from_millis(1)));
        }

        inner.spent += cost;
        inner.last_batch = Some(now);
        None
    }
}

pub type CompareFuture<'a> = Pin<Box<dyn Future<Output = Result<Comparison, ComparatorError>> + Send + 'a>>;

/// Direct redemption of an instrument for the reference asset.
pub trait RedemptionRouter: Send + Sync {
    fn redeem<'a>(&'a self, request: &'a RouteRequest, cancel: &'a CancelSignal) -> CompareFuture<'a>;
}

pub struct AggregatorComparator {
    source: Arc<dyn RouteSource>,
    config: ComparatorConfig,
    budget: CostBudget,
    sequence: tokio::sync::Mutex<()>,
}

impl AggregatorComparator {
    pub fn new(source: Arc<dyn RouteSource>, config: ComparatorConfig) -> Self {
        let budget = CostBudget::new(config.budget_per_window, config.window, config.batch_spacing);
        Self {
            source,
            config,
            budget,
            sequence: tokio::sync::Mutex::new(()),
        }
    }

    pub fn budget(&self) -> &CostBudget {
        &self.budget
    }

    /// Queries every backend in order and returns the best quote.
    pub async fn compare(
        &self,
        request: &RouteRequest,
        cancel: &CancelSignal,
    ) -> Result<Comparison, ComparatorError> {
        if self.config.backends.is_empty() {
            return Err(ComparatorError::NoBackends);
        }

        // One comparison at a time, process-wide.
        let _sequence = self.sequence.lock().await;
        let batch_cost = self.config.batch_cost();
        self.budget.reserve(batch_cost, cancel).await?;

        let mut candidates = Vec::with_capacity(self.config.backends.len());
        let mut best: Option<(usize, RouteQuote)> = None;
        let mut cost_charged = 0;

        for (index, backend) in self.config.backends.iter().enumerate() {
            if index > 0 {
                cancel.sleep(self.config.call_spacing).await?;
            }

            let result = self.source.route(request, Some(&backend.name)).await;
            cost_charged += backend.cost;
            match &result {
                Ok(quote) => {
                    debug!(
                        backend = %backend.name,
                        amount_out = %quote.amount_out,
                        "backend quote"
                    );
                    if best
                        .as_ref()
                        .map_or(true, |(_, current)| quote.amount_out > current.amount_out)
                    {
                        best = Some((index, quote.clone()));
                    }
                }
                Err(error) => {
                    warn!(backend = %backend.name, error = %error, "backend failed");
                }
            }
            candidates.push(AggregatorCandidate {
                backend: backend.name.clone(),
                cost: backend.cost,
                result,
            });
        }

        let Some((index, quote)) = best else {
            return Err(ComparatorError::AllBackendsFailed {
                candidates,
                cost_charged,
            });
        };
        let winner = candidates[index].backend.clone();
        info!(winner = %winner, amount_out = %quote.amount_out, cost_charged, "comparison complete");

        Ok(Comparison {
            winner,
            quote,
            candidates,
            cost_charged,
        })
    }
}

impl RedemptionRouter for AggregatorComparator {
    fn redeem<'a>(&'a self, request: &'a RouteRequest, cancel: &'a CancelSignal) -> CompareFuture<'a> {
        Box::pin(self.compare(request, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backends_cost_thirty_five_units() {
        let config = ComparatorConfig::default();
        assert_eq!(config.batch_cost(), 35);
        assert_eq!(config.backends[0].name, "kyberswap");
    }

    #[test]
    fn budget_charges_within_window_then_defers() {
        let budget = CostBudget::new(100, Duration::from_secs(60), Duration::ZERO);
        let start = Instant::now();

        assert_eq!(budget.try_reserve(35, start), None);
        assert_eq!(budget.try_reserve(35, start + Duration::from_secs(1)), None);
        assert_eq!(
            budget.try_reserve(35, start + Duration::from_secs(10)),
            Some(Duration::from_secs(50))
        );
        assert_eq!(budget.spent(), 70);

        assert_eq!(budget.try_reserve(35, start + Duration::from_secs(60)), None);
        assert_eq!(budget.spent(), 35);
    }

    #[test]
    fn budget_enforces_spacing_between_batches() {
        let budget = CostBudget::new(100, Duration::from_secs(60), Duration::from_secs(20));
        let start = Instant::now();

        assert_eq!(budget.try_reserve(5, start), None);
        assert_eq!(
            budget.try_reserve(5, start + Duration::from_secs(5)),
            Some(Duration::from_secs(15))
        );
        assert_eq!(budget.try_reserve(5, start + Duration::from_secs(20)), None);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let budget = CostBudget::new(10, Duration::from_secs(60), Duration::ZERO);
        let error = budget
            .reserve(11, &CancelSignal::new())
            .await
            .expect_err("cannot ever fit");
        assert_eq!(error, ComparatorError::BatchExceedsBudget { cost: 11, budget: 10 });
    }
}
