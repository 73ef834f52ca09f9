use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapter::{AdapterError, ProtocolAdapter};
use crate::cancel::{CancelSignal, Cancelled};
use crate::domain::amount::{self, AmountError};
use crate::domain::{u128_string, Address, ProtocolBalances};

/// One row of the flat `protocol.network.position` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLine {
    #[serde(with = "u128_string")]
    pub amount: u128,
    pub priced: bool,
}

/// Merged output of every protocol adapter for one holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub holder: Address,
    pub protocols: BTreeMap<String, ProtocolBalances>,
    /// Adapters that produced no output, with the reason.
    pub failed_protocols: BTreeMap<String, String>,
    pub positions: BTreeMap<String, PositionLine>,
    /// Keys into `positions` whose value is `Failed`.
    pub unpriced: Vec<String>,
    #[serde(with = "u128_string")]
    pub total: u128,
    pub reference_decimals: u32,
}

impl PortfolioSummary {
    /// Total in whole reference-asset units.
    pub fn total_normalized(&self) -> Result<Decimal, AmountError> {
        amount::normalize(self.total, self.reference_decimals)
    }

    /// Net asset value per share for `supply` raw units of a share token.
    pub fn share_price(&self, supply: u128, supply_decimals: u32) -> Result<Decimal, AmountError> {
        let supply = amount::normalize(supply, supply_decimals)?;
        if supply.is_zero() {
            return Err(AmountError::DivisionByZero { context: "share price" });
        }
        self.total_normalized()?
            .checked_div(supply)
            .ok_or(AmountError::Overflow { context: "share price" })
    }
}

/// Runs protocol adapters concurrently and sums their integer totals.
pub struct PortfolioAggregator {
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
    reference_decimals: u32,
}

impl PortfolioAggregator {
    pub fn new(adapters: Vec<Arc<dyn ProtocolAdapter>>) -> Self {
        Self {
            adapters,
            reference_decimals: 6,
        }
    }

    pub fn with_reference_decimals(mut self, decimals: u32) -> Self {
        self.reference_decimals = decimals;
        self
    }

    pub async fn aggregate(&self, holder: &Address, cancel: &CancelSignal) -> Result<PortfolioSummary, Cancelled> {
        let outcomes = join_all(
            self.adapters
                .iter()
                .map(|adapter| adapter.get_balances(holder, cancel)),
        )
        .await;

        let mut summary = PortfolioSummary {
            holder: holder.clone(),
            protocols: BTreeMap::new(),
            failed_protocols: BTreeMap::new(),
            positions: BTreeMap::new(),
            unpriced: Vec::new(),
            total: 0,
            reference_decimals: self.reference_decimals,
        };

        for (adapter, outcome) in self.adapters.iter().zip(outcomes) {
            let balances = match outcome {
                Ok(balances) => balances,
                Err(AdapterError::Cancelled(cancelled)) => return Err(cancelled),
                Err(error) => {
                    warn!(protocol = adapter.name(), error = %error, "protocol adapter failed");
                    summary
                        .failed_protocols
                        .insert(adapter.name().to_owned(), error.to_string());
                    continue;
                }
            };

            for position in balances.positions() {
                let key = format!("{}.{}.{}", position.protocol, position.network, position.instrument);
                if !position.is_priced() {
                    summary.unpriced.push(key.clone());
                }
                summary.positions.insert(
                    key,
                    PositionLine {
                        amount: position.subtotal,
                        priced: position.is_priced(),
                    },
                );
            }
            summary.total = summary.total.saturating_add(balances.total);
            summary.protocols.insert(adapter.name().to_owned(), balances);
        }

        info!(
            holder = %holder,
            protocols = summary.protocols.len(),
            positions = summary.positions.len(),
            unpriced = summary.unpriced.len(),
            total = %summary.total,
            "portfolio aggregated"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn summary(total: u128) -> PortfolioSummary {
        PortfolioSummary {
            holder: Address::zero(),
            protocols: BTreeMap::new(),
            failed_protocols: BTreeMap::new(),
            positions: BTreeMap::new(),
            unpriced: Vec::new(),
            total,
            reference_decimals: 6,
        }
    }

    #[test]
    fn share_price_divides_normalized_total_by_supply() {
        // 2,500 USDC across 1,000 shares of an 18-decimal token.
        let nav = summary(2_500_000_000)
            .share_price(1_000 * 10_u128.pow(18), 18)
            .expect("valid supply");
        assert_eq!(nav, dec!(2.5));
    }

    #[test]
    fn share_price_rejects_zero_supply() {
        assert_eq!(
            summary(1).share_price(0, 18),
            Err(AmountError::DivisionByZero { context: "share price" })
        );
    }

    #[test]
    fn summary_serializes_amounts_as_strings() {
        let mut summary = summary(1_750_000);
        summary.positions.insert(
            String::from("spot.ethereum.GHO"),
            PositionLine {
                amount: 1_750_000,
                priced: true,
            },
        );
        let value = serde_json::to_value(&summary).expect("serializable");
        assert_eq!(value["total"], serde_json::json!("1750000"));
        assert_eq!(value["positions"]["spot.ethereum.GHO"]["amount"], serde_json::json!("1750000"));
    }
}
