//! Recursive valuation of composite instruments.
//!
//! Each call walks the same states:
//!
//! 1. direct attempt: ask a venue for the instrument's value in one hop
//!    (skipped when the strategy has no route);
//! 2. decompose: split the position into legs from on-chain totals;
//! 3. convert legs: value every leg, recursing into wrapped legs;
//! 4. reconcile: when both paths priced, keep the larger.
//!
//! Plain tokens are leaves priced through [`SpotPricer`], subject to the
//! per-asset sanity floors.

mod strategy;

pub use strategy::{
    DecomposeContext, DecomposeWhen, DecompositionStrategy, DirectRoute, LegsFuture,
    LiquidityPoolStrategy, PrincipalTokenStrategy, StrategyRegistry, VaultShareStrategy,
};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::{CancelSignal, Cancelled};
use crate::chain::{ChainReadError, ChainReadErrorKind, ChainReader};
use crate::comparator::{ComparatorError, RedemptionRouter};
use crate::domain::amount::{self, AmountError};
use crate::domain::{
    Address, ConversionMethod, ConversionResult, Instrument, InstrumentClass, Leg, Network, Token,
};
use crate::quote_client::{QuoteRequest, SpotPricer};
use crate::registry::TokenRegistry;
use crate::routing_client::RouteRequest;

pub const DEFAULT_MAX_DEPTH: usize = 4;

/// Re-quote an asset on `secondary` when its rate on `network` is below `floor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityFloor {
    pub network: Network,
    pub symbol: String,
    pub floor: Decimal,
    pub secondary: Network,
}

impl SanityFloor {
    pub fn defaults() -> Vec<Self> {
        vec![Self {
            network: Network::Base,
            symbol: String::from("USR"),
            floor: Decimal::new(9, 1),
            secondary: Network::Ethereum,
        }]
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecomposeError {
    #[error("token {address} on {network} is not in the registry")]
    UnknownToken { network: Network, address: Address },
    #[error("no reference asset configured for {network}")]
    NoReferenceAsset { network: Network },
    #[error("'{symbol}' is not a {class} instrument")]
    StrategyMismatch { symbol: String, class: InstrumentClass },
    #[error("decomposing '{symbol}' exceeded max depth {max_depth}")]
    DepthExceeded { symbol: String, max_depth: usize },
    #[error("pool {pool} on {network} has zero total supply")]
    EmptyPool { network: Network, pool: Address },
    #[error(transparent)]
    Chain(ChainReadError),
    #[error(transparent)]
    Amount(#[from] AmountError),
    #[error("'{symbol}' on {network} could not be priced: {note}")]
    Unpriced {
        symbol: String,
        network: Network,
        note: String,
    },
    #[error("every valuation path failed for '{symbol}': direct: {direct}; decompose: {decompose}")]
    AllPathsFailed {
        symbol: String,
        direct: String,
        decompose: String,
    },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl From<ChainReadError> for DecomposeError {
    fn from(error: ChainReadError) -> Self {
        match error.kind() {
            ChainReadErrorKind::Cancelled => Self::Cancelled(Cancelled),
            _ => Self::Chain(error),
        }
    }
}

/// Authoritative value of one position plus the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Valuation {
    pub result: ConversionResult,
    /// Legs of the top-level decomposition, empty when it did not run.
    pub legs: Vec<Leg>,
    pub direct_amount: Option<u128>,
    pub decomposed_amount: Option<u128>,
    /// `(direct - decomposed) / decomposed * 100`, when both priced.
    pub delta_pct: Option<Decimal>,
}

impl Valuation {
    fn single(result: ConversionResult) -> Self {
        Self {
            result,
            legs: Vec::new(),
            direct_amount: None,
            decomposed_amount: None,
            delta_pct: None,
        }
    }
}

/// Picks the larger of two priced paths. Ties go to the direct quote.
pub fn reconcile(direct: &ConversionResult, decomposed: &ConversionResult) -> (ConversionResult, Option<Decimal>) {
    let delta_pct = delta_pct(direct.amount, decomposed.amount);
    let mut chosen = if direct.amount >= decomposed.amount {
        ConversionResult {
            method: ConversionMethod::Direct,
            ..direct.clone()
        }
    } else {
        ConversionResult {
            method: ConversionMethod::Fallback,
            ..decomposed.clone()
        }
    };
    if let Some(delta) = delta_pct {
        let note = format!("direct {} vs decomposed {} ({delta:.4}%)", direct.amount, decomposed.amount);
        chosen.note = if chosen.note.is_empty() {
            note
        } else {
            format!("{}; {note}", chosen.note)
        };
    }
    (chosen, delta_pct)
}

fn delta_pct(direct: u128, decomposed: u128) -> Option<Decimal> {
    let direct = amount::normalize(direct, 0).ok()?;
    let decomposed = amount::normalize(decomposed, 0).ok()?;
    if decomposed.is_zero() {
        return None;
    }
    ((direct - decomposed) / decomposed)
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|pct| pct.round_dp(4))
}

type ValuationFuture<'a> = Pin<Box<dyn Future<Output = Result<Valuation, DecomposeError>> + Send + 'a>>;
type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct PositionDecomposer {
    registry: Arc<TokenRegistry>,
    chain: Arc<dyn ChainReader>,
    pricer: Arc<dyn SpotPricer>,
    router: Arc<dyn RedemptionRouter>,
    strategies: StrategyRegistry,
    sanity_floors: Vec<SanityFloor>,
    max_depth: usize,
    clock: Clock,
}

impl PositionDecomposer {
    pub fn new(
        registry: Arc<TokenRegistry>,
        chain: Arc<dyn ChainReader>,
        pricer: Arc<dyn SpotPricer>,
        router: Arc<dyn RedemptionRouter>,
    ) -> Self {
        Self {
            registry,
            chain,
            pricer,
            router,
            strategies: StrategyRegistry::with_defaults(),
            sanity_floors: SanityFloor::defaults(),
            max_depth: DEFAULT_MAX_DEPTH,
            clock: Arc::new(|| time::OffsetDateTime::now_utc().unix_timestamp()),
        }
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_sanity_floors(mut self, floors: Vec<SanityFloor>) -> Self {
        self.sanity_floors = floors;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Pins valuation time (unix seconds).
    pub fn with_fixed_time(mut self, now: i64) -> Self {
        self.clock = Arc::new(move || now);
        self
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    /// Values `amount` of `instrument` held by `holder` in the network's reference asset.
    pub async fn value(
        &self,
        instrument: &Instrument,
        amount: u128,
        holder: &Address,
        cancel: &CancelSignal,
    ) -> Result<Valuation, DecomposeError> {
        let ctx = DecomposeContext {
            chain: self.chain.as_ref(),
            registry: self.registry.as_ref(),
            holder,
            now: (self.clock)(),
            cancel,
        };
        self.value_at_depth(instrument, amount, &ctx, cancel, 0).await
    }

    fn value_at_depth<'a>(
        &'a self,
        instrument: &'a Instrument,
        amount: u128,
        ctx: &'a DecomposeContext<'a>,
        cancel: &'a CancelSignal,
        depth: usize,
    ) -> ValuationFuture<'a> {
        Box::pin(async move {
            cancel.check()?;
            let network = instrument.network();
            let reference = self
                .registry
                .reference_asset(network)
                .ok_or(DecomposeError::NoReferenceAsset { network })?;

            if amount == 0 {
                return Ok(Valuation::single(ConversionResult::zero("zero balance")));
            }
            if depth > self.max_depth {
                return Err(DecomposeError::DepthExceeded {
                    symbol: instrument.symbol().to_owned(),
                    max_depth: self.max_depth,
                });
            }

            let Some(strategy) = self.strategies.get(instrument.kind.class()) else {
                let result = self.price_leaf(&instrument.token, amount, reference, cancel).await?;
                return Ok(Valuation::single(result));
            };

            let direct = match strategy.direct_route(instrument, amount, reference, ctx) {
                DirectRoute::None => None,
                DirectRoute::Spot => Some(self.spot_direct(&instrument.token, amount, reference, cancel).await?),
                DirectRoute::Market(request) => Some(self.market_direct(&request, reference, cancel).await?),
            };
            if let Some(Ok(result)) = &direct {
                debug!(symbol = instrument.symbol(), amount = %result.amount, "direct attempt priced");
                if strategy.decompose_when(instrument, ctx) == DecomposeWhen::DirectFailed {
                    return Ok(Valuation {
                        direct_amount: Some(result.amount),
                        ..Valuation::single(result.clone())
                    });
                }
            }

            let decomposed = match strategy.decompose(instrument, amount, ctx).await {
                Ok(legs) => match self.convert_legs(instrument, amount, &legs, reference, ctx, cancel, depth).await {
                    Ok(result) => Ok((result, legs)),
                    Err(DecomposeError::Cancelled(cancelled)) => return Err(cancelled.into()),
                    Err(error) => Err(error),
                },
                Err(DecomposeError::Cancelled(cancelled)) => return Err(cancelled.into()),
                Err(error) => Err(error),
            };

            match (direct, decomposed) {
                (Some(Ok(direct)), Ok((decomposed, legs))) => {
                    let (result, delta_pct) = reconcile(&direct, &decomposed);
                    info!(
                        symbol = instrument.symbol(),
                        direct = %direct.amount,
                        decomposed = %decomposed.amount,
                        method = %result.method,
                        delta_pct = ?delta_pct,
                        "reconciled valuation paths"
                    );
                    Ok(Valuation {
                        result,
                        legs,
                        direct_amount: Some(direct.amount),
                        decomposed_amount: Some(decomposed.amount),
                        delta_pct,
                    })
                }
                (Some(Ok(direct)), Err(error)) => {
                    warn!(symbol = instrument.symbol(), error = %error, "decomposition failed, keeping direct value");
                    Ok(Valuation {
                        direct_amount: Some(direct.amount),
                        ..Valuation::single(direct)
                    })
                }
                (direct, Ok((decomposed, legs))) => {
                    if let Some(Err(note)) = &direct {
                        info!(symbol = instrument.symbol(), reason = %note, "direct attempt failed, using decomposition");
                    }
                    Ok(Valuation {
                        direct_amount: None,
                        decomposed_amount: Some(decomposed.amount),
                        legs,
                        ..Valuation::single(decomposed)
                    })
                }
                (direct, Err(error)) => Err(DecomposeError::AllPathsFailed {
                    symbol: instrument.symbol().to_owned(),
                    direct: match direct {
                        Some(Err(note)) => note,
                        _ => String::from("no direct route"),
                    },
                    decompose: error.to_string(),
                }),
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn convert_legs(
        &self,
        parent: &Instrument,
        amount: u128,
        legs: &[Leg],
        reference: &Token,
        ctx: &DecomposeContext<'_>,
        cancel: &CancelSignal,
        depth: usize,
    ) -> Result<ConversionResult, DecomposeError> {
        let mut total: u128 = 0;
        let mut impact: Option<Decimal> = None;
        let mut parts = Vec::with_capacity(legs.len());

        for leg in legs {
            let instrument = self
                .registry
                .instrument(leg.token.network, &leg.token.address)
                .ok_or_else(|| DecomposeError::UnknownToken {
                    network: leg.token.network,
                    address: leg.token.address.clone(),
                })?;
            let valuation = self
                .value_at_depth(instrument, leg.amount, ctx, cancel, depth + 1)
                .await?;

            total = total
                .checked_add(valuation.result.amount)
                .ok_or(AmountError::Overflow { context: "leg sum" })?;
            if let Some(leg_impact) = valuation.result.price_impact {
                impact = Some(impact.unwrap_or(Decimal::ZERO).max(leg_impact));
            }
            parts.push(format!("{} {}", leg.token.symbol, valuation.result.amount));
        }

        let rate = amount::realized_rate(amount, parent.decimals(), total, reference.decimals)?;
        Ok(ConversionResult {
            amount: total,
            price_impact: impact,
            method: ConversionMethod::Fallback,
            source: String::from("decomposition"),
            rate,
            fee_percentage: None,
            note: format!("legs: {}", parts.join(", ")),
        })
    }

    /// `Ok(Err(note))` is a failed attempt; `Err` aborts the whole valuation.
    async fn spot_direct(
        &self,
        token: &Token,
        amount: u128,
        reference: &Token,
        cancel: &CancelSignal,
    ) -> Result<Result<ConversionResult, String>, DecomposeError> {
        let request = QuoteRequest::new(token.clone(), reference.clone(), amount);
        let result = self.pricer.price(&request, cancel).await;
        cancel.check()?;
        if result.is_priced() {
            Ok(Ok(result))
        } else {
            Ok(Err(result.note))
        }
    }

    async fn market_direct(
        &self,
        request: &RouteRequest,
        reference: &Token,
        cancel: &CancelSignal,
    ) -> Result<Result<ConversionResult, String>, DecomposeError> {
        let comparison = match self.router.redeem(request, cancel).await {
            Ok(comparison) => comparison,
            Err(ComparatorError::Cancelled(cancelled)) => return Err(cancelled.into()),
            Err(error) => return Ok(Err(error.to_string())),
        };

        let decimals = self
            .registry
            .instrument(request.network, &request.token_in)
            .map(Instrument::decimals)
            .ok_or_else(|| DecomposeError::UnknownToken {
                network: request.network,
                address: request.token_in.clone(),
            })?;
        let rate = amount::realized_rate(
            request.amount_in,
            decimals,
            comparison.quote.amount_out,
            reference.decimals,
        )?;

        Ok(Ok(ConversionResult {
            amount: comparison.quote.amount_out,
            price_impact: comparison.quote.price_impact,
            method: ConversionMethod::Direct,
            source: comparison.winner.clone(),
            rate,
            fee_percentage: None,
            note: format!(
                "best of {} backends, cost {}",
                comparison.candidates.len(),
                comparison.cost_charged
            ),
        }))
    }

    /// Prices a plain token, re-quoting on a secondary network when a sanity floor applies.
    async fn price_leaf(
        &self,
        token: &Token,
        amount: u128,
        reference: &Token,
        cancel: &CancelSignal,
    ) -> Result<ConversionResult, DecomposeError> {
        let request = QuoteRequest::new(token.clone(), reference.clone(), amount);
        let primary = self.pricer.price(&request, cancel).await;
        cancel.check()?;
        if !primary.is_priced() {
            return Err(DecomposeError::Unpriced {
                symbol: token.symbol.clone(),
                network: token.network,
                note: primary.note,
            });
        }

        let Some(floor) = self
            .sanity_floors
            .iter()
            .find(|floor| floor.network == token.network && floor.symbol == token.symbol)
        else {
            return Ok(primary);
        };
        if primary.rate >= floor.floor {
            return Ok(primary);
        }

        warn!(
            symbol = %token.symbol,
            network = %token.network,
            rate = %primary.rate,
            floor = %floor.floor,
            secondary = %floor.secondary,
            "rate below sanity floor, re-quoting on secondary network"
        );
        let secondary = match self.secondary_quote(token, amount, floor.secondary, cancel).await {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(primary),
            Err(error) => {
                warn!(symbol = %token.symbol, error = %error, "secondary quote unavailable");
                return Ok(primary);
            }
        };
        if secondary.rate < primary.rate {
            info!(symbol = %token.symbol, "keeping primary rate despite sanity floor");
            return Ok(primary);
        }

        let value = amount::apply_rate(amount, token.decimals, secondary.rate, reference.decimals)?;
        info!(
            symbol = %token.symbol,
            secondary = %floor.secondary,
            rate = %secondary.rate,
            "using secondary network rate"
        );
        Ok(ConversionResult {
            amount: value,
            note: format!("rate from {} (primary rate {})", floor.secondary, primary.rate),
            ..secondary
        })
    }

    async fn secondary_quote(
        &self,
        token: &Token,
        amount: u128,
        network: Network,
        cancel: &CancelSignal,
    ) -> Result<Option<ConversionResult>, DecomposeError> {
        let (Some(counterpart), Some(reference)) = (
            self.registry.by_symbol(network, &token.symbol),
            self.registry.reference_asset(network),
        ) else {
            return Ok(None);
        };

        let counterpart_amount = amount::rescale(amount, token.decimals, counterpart.decimals())?;
        let request = QuoteRequest::new(counterpart.token.clone(), reference.clone(), counterpart_amount);
        let result = self.pricer.price(&request, cancel).await;
        cancel.check()?;
        Ok(result.is_priced().then_some(result))
    }
}
