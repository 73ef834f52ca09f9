use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Address, Network};

/// A token as declared in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub network: Network,
    pub symbol: String,
    pub address: Address,
    pub decimals: u32,
}

/// Closed set of instrument shapes the engine knows how to value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Priced directly against the reference asset.
    PlainToken,
    /// Fixed-maturity claim on `underlying`, tradable at a discount before `maturity`.
    PrincipalToken {
        underlying: Address,
        /// Standardized-yield wrapper the claim is denominated in.
        #[serde(default)]
        standardized_yield: Option<Address>,
        market: Address,
        /// Unix seconds.
        maturity: i64,
    },
    /// Pro-rata claim on the reserves of a pool whose share token is this instrument.
    LiquidityPoolShare {
        #[serde(default = "default_true")]
        direct_route: bool,
    },
    /// Deposit receipt convertible into `asset` by the vault's share math.
    VaultShare { asset: Address },
}

fn default_true() -> bool {
    true
}

/// Data-free discriminant of [`InstrumentKind`], used to key decomposition strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentClass {
    PlainToken,
    PrincipalToken,
    LiquidityPoolShare,
    VaultShare,
}

impl InstrumentKind {
    pub const fn class(&self) -> InstrumentClass {
        match self {
            Self::PlainToken => InstrumentClass::PlainToken,
            Self::PrincipalToken { .. } => InstrumentClass::PrincipalToken,
            Self::LiquidityPoolShare { .. } => InstrumentClass::LiquidityPoolShare,
            Self::VaultShare { .. } => InstrumentClass::VaultShare,
        }
    }
}

impl InstrumentClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlainToken => "plain_token",
            Self::PrincipalToken => "principal_token",
            Self::LiquidityPoolShare => "liquidity_pool_share",
            Self::VaultShare => "vault_share",
        }
    }
}

impl Display for InstrumentClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry entry: a token plus how it is valued and where it is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub token: Token,
    pub kind: InstrumentKind,
    /// Protocol adapter that enumerates this instrument, if any.
    pub protocol: Option<String>,
    /// Staking contract holding the position and accruing rewards, if any.
    pub staking_contract: Option<Address>,
}

impl Instrument {
    pub fn symbol(&self) -> &str {
        &self.token.symbol
    }

    pub fn network(&self) -> Network {
        self.token.network
    }

    pub fn address(&self) -> &Address {
        &self.token.address
    }

    pub fn decimals(&self) -> u32 {
        self.token.decimals
    }
}

/// Raw quote returned by a venue. Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub sell_token: Address,
    pub buy_token: Address,
    pub sell_amount: u128,
    pub buy_amount: u128,
    pub fee_amount: u128,
    pub price_impact: Option<Decimal>,
    pub source: String,
    pub fallback: bool,
}

/// How a valuation was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversionMethod {
    Direct,
    Fallback,
    Failed,
}

impl ConversionMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "Direct",
            Self::Fallback => "Fallback",
            Self::Failed => "Failed",
        }
    }
}

impl Display for ConversionMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of an amount expressed in the reference asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Reference-asset minor units.
    #[serde(with = "u128_string")]
    pub amount: u128,
    pub price_impact: Option<Decimal>,
    pub method: ConversionMethod,
    pub source: String,
    /// Reference asset per whole sell token.
    pub rate: Decimal,
    pub fee_percentage: Option<Decimal>,
    pub note: String,
}

impl ConversionResult {
    pub fn failed(note: impl Into<String>) -> Self {
        Self {
            amount: 0,
            price_impact: None,
            method: ConversionMethod::Failed,
            source: String::from("Failed"),
            rate: Decimal::ZERO,
            fee_percentage: None,
            note: note.into(),
        }
    }

    /// Valid zero valuation, e.g. for an empty balance.
    pub fn zero(note: impl Into<String>) -> Self {
        Self {
            amount: 0,
            price_impact: None,
            method: ConversionMethod::Direct,
            source: String::from("none"),
            rate: Decimal::ZERO,
            fee_percentage: None,
            note: note.into(),
        }
    }

    pub const fn is_priced(&self) -> bool {
        !matches!(self.method, ConversionMethod::Failed)
    }

    pub const fn is_fallback(&self) -> bool {
        matches!(self.method, ConversionMethod::Fallback)
    }
}

/// One constituent produced by decomposing a composite instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub token: Token,
    #[serde(with = "u128_string")]
    pub amount: u128,
}

/// Reward accrued by a staked position, with its valuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEntry {
    pub symbol: String,
    pub token: Address,
    #[serde(with = "u128_string")]
    pub amount: u128,
    pub decimals: u32,
    pub value: ConversionResult,
}

/// A valued holding of one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub protocol: String,
    pub network: Network,
    pub instrument: String,
    #[serde(with = "u128_string")]
    pub amount: u128,
    pub decimals: u32,
    pub legs: Vec<Leg>,
    pub value: ConversionResult,
    pub rewards: Vec<RewardEntry>,
    /// Position value plus reward values, reference-asset minor units.
    #[serde(with = "u128_string")]
    pub subtotal: u128,
}

impl Position {
    pub const fn is_priced(&self) -> bool {
        self.value.is_priced()
    }
}

/// Positions of one protocol on one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBalances {
    pub positions: BTreeMap<String, Position>,
    #[serde(with = "u128_string")]
    pub total: u128,
}

/// Output of a protocol adapter: `network -> position id -> position`, plus totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolBalances {
    pub protocol: String,
    pub networks: BTreeMap<Network, NetworkBalances>,
    #[serde(with = "u128_string")]
    pub total: u128,
}

impl ProtocolBalances {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Inserts a position and folds its subtotal into the network and protocol totals.
    pub fn insert(&mut self, position: Position) {
        let subtotal = position.subtotal;
        let network = self.networks.entry(position.network).or_default();
        network.total = network.total.saturating_add(subtotal);
        network.positions.insert(position.instrument.clone(), position);
        self.total = self.total.saturating_add(subtotal);
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.networks
            .values()
            .flat_map(|network| network.positions.values())
    }
}

/// Serializes `u128` minor-unit amounts as decimal strings.
pub(crate) mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
