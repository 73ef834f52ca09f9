//! Protocol adapters: enumerate a holder's positions and value each one.
//!
//! An adapter never aborts because one position could not be priced. Failed
//! balance reads and failed valuations become positions with a `Failed`
//! value and a zero subtotal, so the output marks them instead of dropping
//! them. Only cancellation ends a run early.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::{CancelSignal, Cancelled};
use crate::chain::{ChainReadErrorKind, ChainReader, EarnedReward};
use crate::decomposer::{DecomposeError, PositionDecomposer};
use crate::domain::{Address, ConversionResult, Instrument, Leg, Position, ProtocolBalances, RewardEntry};
use crate::quote_client::{QuoteRequest, SpotPricer};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("protocol '{protocol}' has no instruments in the registry")]
    UnknownProtocol { protocol: String },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

pub type BalancesFuture<'a> = Pin<Box<dyn Future<Output = Result<ProtocolBalances, AdapterError>> + Send + 'a>>;

/// Per-protocol position source.
pub trait ProtocolAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// `network -> position id -> valued position`, plus integer totals.
    fn get_balances<'a>(&'a self, holder: &'a Address, cancel: &'a CancelSignal) -> BalancesFuture<'a>;
}

/// Adapter over the registry instruments tagged with one protocol name.
pub struct RegistryAdapter {
    protocol: String,
    decomposer: Arc<PositionDecomposer>,
    chain: Arc<dyn ChainReader>,
    pricer: Arc<dyn SpotPricer>,
}

impl RegistryAdapter {
    pub fn new(
        protocol: impl Into<String>,
        decomposer: Arc<PositionDecomposer>,
        chain: Arc<dyn ChainReader>,
        pricer: Arc<dyn SpotPricer>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            decomposer,
            chain,
            pricer,
        }
    }

    async fn balances(&self, holder: &Address, cancel: &CancelSignal) -> Result<ProtocolBalances, AdapterError> {
        let registry = self.decomposer.registry();
        let instruments: Vec<&Instrument> = registry.instruments_for_protocol(&self.protocol).collect();
        if instruments.is_empty() {
            return Err(AdapterError::UnknownProtocol {
                protocol: self.protocol.clone(),
            });
        }

        let mut balances = ProtocolBalances::new(&self.protocol);
        for instrument in instruments {
            cancel.check()?;
            if let Some(position) = self.position(instrument, holder, cancel).await? {
                balances.insert(position);
            }
        }

        info!(
            protocol = %self.protocol,
            positions = balances.positions().count(),
            total = %balances.total,
            "protocol balances computed"
        );
        Ok(balances)
    }

    /// `None` when the holder has nothing in this instrument.
    async fn position(
        &self,
        instrument: &Instrument,
        holder: &Address,
        cancel: &CancelSignal,
    ) -> Result<Option<Position>, AdapterError> {
        let network = instrument.network();
        let held_at = instrument.staking_contract.as_ref().unwrap_or(instrument.address());

        let amount = match self.chain.balance_of(network, held_at, holder, cancel).await {
            Ok(amount) => amount,
            Err(error) if error.kind() == ChainReadErrorKind::Cancelled => return Err(Cancelled.into()),
            Err(error) => {
                warn!(
                    protocol = %self.protocol,
                    instrument = instrument.symbol(),
                    error = %error,
                    "balance read failed, marking position unpriced"
                );
                let value = ConversionResult::failed(format!("balance read failed: {error}"));
                return Ok(Some(self.assemble(instrument, 0, Vec::new(), value, Vec::new())));
            }
        };
        if amount == 0 {
            debug!(protocol = %self.protocol, instrument = instrument.symbol(), "zero balance, skipping");
            return Ok(None);
        }

        let (value, legs) = match self.decomposer.value(instrument, amount, holder, cancel).await {
            Ok(valuation) => (valuation.result, valuation.legs),
            Err(DecomposeError::Cancelled(cancelled)) => return Err(cancelled.into()),
            Err(error) => {
                warn!(
                    protocol = %self.protocol,
                    instrument = instrument.symbol(),
                    error = %error,
                    "valuation failed, marking position unpriced"
                );
                (ConversionResult::failed(error.to_string()), Vec::new())
            }
        };
        let rewards = self.rewards(instrument, holder, cancel).await?;

        Ok(Some(self.assemble(instrument, amount, legs, value, rewards)))
    }

    async fn rewards(
        &self,
        instrument: &Instrument,
        holder: &Address,
        cancel: &CancelSignal,
    ) -> Result<Vec<RewardEntry>, AdapterError> {
        let Some(staking_contract) = &instrument.staking_contract else {
            return Ok(Vec::new());
        };
        let network = instrument.network();

        let earned = match self.chain.earned_rewards(network, staking_contract, holder, cancel).await {
            Ok(earned) => earned,
            Err(error) if error.kind() == ChainReadErrorKind::Cancelled => return Err(Cancelled.into()),
            Err(error) => {
                warn!(instrument = instrument.symbol(), error = %error, "reward read failed");
                return Ok(Vec::new());
            }
        };

        let mut entries = Vec::with_capacity(earned.len());
        for EarnedReward { token, amount } in earned.into_iter().filter(|reward| reward.amount > 0) {
            let registry = self.decomposer.registry();
            let (Some(reward), Some(reference)) =
                (registry.instrument(network, &token), registry.reference_asset(network))
            else {
                entries.push(RewardEntry {
                    symbol: token.to_string(),
                    token,
                    amount,
                    decimals: 0,
                    value: ConversionResult::failed("reward token not in registry"),
                });
                continue;
            };

            let request = QuoteRequest::new(reward.token.clone(), reference.clone(), amount);
            let value = self.pricer.price(&request, cancel).await;
            cancel.check()?;
            debug!(reward = reward.symbol(), amount = %amount, value = %value.amount, "reward valued");
            entries.push(RewardEntry {
                symbol: reward.symbol().to_owned(),
                token,
                amount,
                decimals: reward.decimals(),
                value,
            });
        }
        Ok(entries)
    }

    fn assemble(
        &self,
        instrument: &Instrument,
        amount: u128,
        legs: Vec<Leg>,
        value: ConversionResult,
        rewards: Vec<RewardEntry>,
    ) -> Position {
        let subtotal = rewards
            .iter()
            .fold(value.amount, |sum, reward| sum.saturating_add(reward.value.amount));
        Position {
            protocol: self.protocol.clone(),
            network: instrument.network(),
            instrument: instrument.symbol().to_owned(),
            amount,
            decimals: instrument.decimals(),
            legs,
            value,
            rewards,
            subtotal,
        }
    }
}

impl ProtocolAdapter for RegistryAdapter {
    fn name(&self) -> &str {
        &self.protocol
    }

    fn get_balances<'a>(&'a self, holder: &'a Address, cancel: &'a CancelSignal) -> BalancesFuture<'a> {
        Box::pin(self.balances(holder, cancel))
    }
}
