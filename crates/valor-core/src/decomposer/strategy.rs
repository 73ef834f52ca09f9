use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::cancel::CancelSignal;
use crate::chain::ChainReader;
use crate::decomposer::DecomposeError;
use crate::domain::amount;
use crate::domain::{Address, Instrument, InstrumentClass, InstrumentKind, Leg, Network, Token};
use crate::registry::TokenRegistry;
use crate::routing_client::{RouteKind, RouteRequest};

/// Everything a strategy may read while decomposing one position.
pub struct DecomposeContext<'a> {
    pub chain: &'a dyn ChainReader,
    pub registry: &'a TokenRegistry,
    pub holder: &'a Address,
    /// Valuation time, unix seconds.
    pub now: i64,
    pub cancel: &'a CancelSignal,
}

impl DecomposeContext<'_> {
    pub fn token(&self, network: Network, address: &Address) -> Result<Token, DecomposeError> {
        self.registry
            .instrument(network, address)
            .map(|instrument| instrument.token.clone())
            .ok_or_else(|| DecomposeError::UnknownToken {
                network,
                address: address.clone(),
            })
    }
}

/// How to ask a venue for the instrument's value in one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectRoute {
    /// No venue can redeem this instrument directly.
    None,
    /// Spot quote of the instrument itself against the reference asset.
    Spot,
    /// Market redemption compared across routing backends.
    Market(RouteRequest),
}

/// When the decomposition path runs relative to the direct attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecomposeWhen {
    /// Both paths run and the results are reconciled.
    Always,
    /// Decomposition is only a fallback for a failed direct attempt.
    DirectFailed,
}

pub type LegsFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Leg>, DecomposeError>> + Send + 'a>>;

/// Valuation recipe for one instrument class.
pub trait DecompositionStrategy: Send + Sync {
    fn class(&self) -> InstrumentClass;

    fn direct_route(
        &self,
        instrument: &Instrument,
        amount: u128,
        reference: &Token,
        ctx: &DecomposeContext<'_>,
    ) -> DirectRoute;

    fn decompose_when(&self, _instrument: &Instrument, _ctx: &DecomposeContext<'_>) -> DecomposeWhen {
        DecomposeWhen::Always
    }

    /// Splits `amount` of the instrument into its constituent legs.
    fn decompose<'a>(
        &'a self,
        instrument: &'a Instrument,
        amount: u128,
        ctx: &'a DecomposeContext<'a>,
    ) -> LegsFuture<'a>;
}

/// Instrument class -> strategy. Adding a wrapped instrument type is a
/// registration here, never a branch in the decomposer.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<InstrumentClass, Arc<dyn DecompositionStrategy>>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Vault, pool and principal-token strategies. Plain tokens have none.
    pub fn with_defaults() -> Self {
        Self::empty()
            .register(Arc::new(VaultShareStrategy))
            .register(Arc::new(LiquidityPoolStrategy))
            .register(Arc::new(PrincipalTokenStrategy))
    }

    pub fn register(mut self, strategy: Arc<dyn DecompositionStrategy>) -> Self {
        self.strategies.insert(strategy.class(), strategy);
        self
    }

    pub fn get(&self, class: InstrumentClass) -> Option<&Arc<dyn DecompositionStrategy>> {
        self.strategies.get(&class)
    }
}

/// Vault share -> underlying asset via the vault's conversion rate.
pub struct VaultShareStrategy;

impl DecompositionStrategy for VaultShareStrategy {
    fn class(&self) -> InstrumentClass {
        InstrumentClass::VaultShare
    }

    fn direct_route(&self, _: &Instrument, _: u128, _: &Token, _: &DecomposeContext<'_>) -> DirectRoute {
        DirectRoute::Spot
    }

    fn decompose<'a>(
        &'a self,
        instrument: &'a Instrument,
        amount: u128,
        ctx: &'a DecomposeContext<'a>,
    ) -> LegsFuture<'a> {
        Box::pin(async move {
            let InstrumentKind::VaultShare { asset } = &instrument.kind else {
                return Err(DecomposeError::StrategyMismatch {
                    symbol: instrument.symbol().to_owned(),
                    class: instrument.kind.class(),
                });
            };
            let network = instrument.network();
            let token = ctx.token(network, asset)?;
            let assets = ctx
                .chain
                .convert_to_assets(network, instrument.address(), amount, ctx.cancel)
                .await?;
            debug!(vault = instrument.symbol(), shares = %amount, assets = %assets, "vault shares converted");

            Ok(vec![Leg {
                token,
                amount: assets,
            }])
        })
    }
}

/// Pool share -> pro-rata slice of every reserve.
pub struct LiquidityPoolStrategy;

impl DecompositionStrategy for LiquidityPoolStrategy {
    fn class(&self) -> InstrumentClass {
        InstrumentClass::LiquidityPoolShare
    }

    fn direct_route(
        &self,
        instrument: &Instrument,
        amount: u128,
        reference: &Token,
        ctx: &DecomposeContext<'_>,
    ) -> DirectRoute {
        match instrument.kind {
            InstrumentKind::LiquidityPoolShare { direct_route: true } => DirectRoute::Market(RouteRequest {
                network: instrument.network(),
                market: instrument.address().clone(),
                kind: RouteKind::RemoveLiquidity,
                token_in: instrument.address().clone(),
                token_out: reference.address.clone(),
                amount_in: amount,
                receiver: ctx.holder.clone(),
            }),
            _ => DirectRoute::None,
        }
    }

    fn decompose<'a>(
        &'a self,
        instrument: &'a Instrument,
        amount: u128,
        ctx: &'a DecomposeContext<'a>,
    ) -> LegsFuture<'a> {
        Box::pin(async move {
            let network = instrument.network();
            let reserves = ctx.chain.pool_reserves(network, instrument.address(), ctx.cancel).await?;
            if reserves.total_supply == 0 {
                return Err(DecomposeError::EmptyPool {
                    network,
                    pool: instrument.address().clone(),
                });
            }

            let mut legs = Vec::with_capacity(reserves.legs.len());
            for (address, outstanding) in &reserves.legs {
                let token = ctx.token(network, address)?;
                let leg_amount = amount::pro_rata(*outstanding, amount, reserves.total_supply)?;
                debug!(
                    pool = instrument.symbol(),
                    leg = %token.symbol,
                    outstanding = %outstanding,
                    leg_amount = %leg_amount,
                    "pool leg"
                );
                legs.push(Leg {
                    token,
                    amount: leg_amount,
                });
            }
            Ok(legs)
        })
    }
}

/// Principal token -> its yield wrapper (or underlying once matured) at 1:1.
pub struct PrincipalTokenStrategy;

impl PrincipalTokenStrategy {
    fn is_matured(instrument: &Instrument, now: i64) -> bool {
        matches!(instrument.kind, InstrumentKind::PrincipalToken { maturity, .. } if now >= maturity)
    }
}

impl DecompositionStrategy for PrincipalTokenStrategy {
    fn class(&self) -> InstrumentClass {
        InstrumentClass::PrincipalToken
    }

    fn direct_route(
        &self,
        instrument: &Instrument,
        amount: u128,
        reference: &Token,
        ctx: &DecomposeContext<'_>,
    ) -> DirectRoute {
        match &instrument.kind {
            InstrumentKind::PrincipalToken { market, .. } if !Self::is_matured(instrument, ctx.now) => {
                DirectRoute::Market(RouteRequest {
                    network: instrument.network(),
                    market: market.clone(),
                    kind: RouteKind::Swap,
                    token_in: instrument.address().clone(),
                    token_out: reference.address.clone(),
                    amount_in: amount,
                    receiver: ctx.holder.clone(),
                })
            }
            _ => DirectRoute::None,
        }
    }

    // Par value overstates an unmatured claim, so it only stands in for a failed market quote.
    fn decompose_when(&self, _: &Instrument, _: &DecomposeContext<'_>) -> DecomposeWhen {
        DecomposeWhen::DirectFailed
    }

    fn decompose<'a>(
        &'a self,
        instrument: &'a Instrument,
        amount: u128,
        ctx: &'a DecomposeContext<'a>,
    ) -> LegsFuture<'a> {
        Box::pin(async move {
            let InstrumentKind::PrincipalToken {
                underlying,
                standardized_yield,
                ..
            } = &instrument.kind
            else {
                return Err(DecomposeError::StrategyMismatch {
                    symbol: instrument.symbol().to_owned(),
                    class: instrument.kind.class(),
                });
            };

            let redeems_into = if Self::is_matured(instrument, ctx.now) {
                underlying
            } else {
                standardized_yield.as_ref().unwrap_or(underlying)
            };
            let token = ctx.token(instrument.network(), redeems_into)?;
            let leg_amount = amount::rescale(amount, instrument.decimals(), token.decimals)?;

            Ok(vec![Leg {
                token,
                amount: leg_amount,
            }])
        })
    }
}
