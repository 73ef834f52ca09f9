//! Static token and instrument registry.
//!
//! Loaded from a JSON document of the form:
//!
//! ```json
//! {
//!   "networks": {
//!     "ethereum": {
//!       "reference_asset": "USDC",
//!       "instruments": [
//!         { "symbol": "USDC", "address": "0xa0b8...eb48", "decimals": 6, "kind": "plain_token" },
//!         { "symbol": "sGHO", "address": "0x...", "decimals": 18, "protocol": "savings",
//!           "kind": "vault_share", "asset": "0x..." }
//!       ]
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::domain::amount::MAX_DECIMALS;
use crate::domain::{Address, Instrument, InstrumentKind, Network, Token};
use crate::error::{CoreError, ValidationError};

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    networks: BTreeMap<Network, NetworkDocument>,
}

#[derive(Debug, Deserialize)]
struct NetworkDocument {
    reference_asset: String,
    #[serde(default)]
    instruments: Vec<InstrumentDocument>,
}

#[derive(Debug, Deserialize)]
struct InstrumentDocument {
    symbol: String,
    address: Address,
    decimals: u32,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    staking_contract: Option<Address>,
    #[serde(flatten)]
    kind: InstrumentKind,
}

#[derive(Debug, Clone)]
struct NetworkEntry {
    reference: Token,
    /// Declaration order.
    instruments: Vec<Instrument>,
    by_address: HashMap<Address, usize>,
    by_symbol: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    networks: BTreeMap<Network, NetworkEntry>,
}

impl TokenRegistry {
    pub fn from_json_str(input: &str) -> Result<Self, CoreError> {
        let document: RegistryDocument = serde_json::from_str(input)?;
        Ok(Self::from_document(document)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    fn from_document(document: RegistryDocument) -> Result<Self, ValidationError> {
        let mut networks = BTreeMap::new();

        for (network, doc) in document.networks {
            let mut instruments = Vec::with_capacity(doc.instruments.len());
            let mut by_address = HashMap::new();
            let mut by_symbol = HashMap::new();

            for entry in doc.instruments {
                if entry.symbol.trim().is_empty() {
                    return Err(ValidationError::EmptySymbol);
                }
                if entry.decimals > MAX_DECIMALS {
                    return Err(ValidationError::DecimalsTooLarge {
                        decimals: entry.decimals,
                        max: MAX_DECIMALS,
                    });
                }
                let duplicate = || ValidationError::DuplicateInstrument {
                    network: network.to_string(),
                    symbol: entry.symbol.clone(),
                };
                if by_address.contains_key(&entry.address) || by_symbol.contains_key(&entry.symbol) {
                    return Err(duplicate());
                }

                let index = instruments.len();
                by_address.insert(entry.address.clone(), index);
                by_symbol.insert(entry.symbol.clone(), index);
                instruments.push(Instrument {
                    token: Token {
                        network,
                        symbol: entry.symbol,
                        address: entry.address,
                        decimals: entry.decimals,
                    },
                    kind: entry.kind,
                    protocol: entry.protocol,
                    staking_contract: entry.staking_contract,
                });
            }

            let reference = by_symbol
                .get(&doc.reference_asset)
                .map(|&index| instruments[index].token.clone())
                .ok_or_else(|| ValidationError::MissingReferenceAsset {
                    network: network.to_string(),
                    symbol: doc.reference_asset.clone(),
                })?;

            for instrument in &instruments {
                for address in referenced_tokens(&instrument.kind) {
                    if !by_address.contains_key(address) {
                        return Err(ValidationError::DanglingReference {
                            network: network.to_string(),
                            symbol: instrument.token.symbol.clone(),
                            address: address.to_string(),
                        });
                    }
                }
            }

            networks.insert(
                network,
                NetworkEntry {
                    reference,
                    instruments,
                    by_address,
                    by_symbol,
                },
            );
        }

        Ok(Self { networks })
    }

    pub fn networks(&self) -> impl Iterator<Item = Network> + '_ {
        self.networks.keys().copied()
    }

    pub fn reference_asset(&self, network: Network) -> Option<&Token> {
        self.networks.get(&network).map(|entry| &entry.reference)
    }

    pub fn instrument(&self, network: Network, address: &Address) -> Option<&Instrument> {
        let entry = self.networks.get(&network)?;
        entry
            .by_address
            .get(address)
            .map(|&index| &entry.instruments[index])
    }

    pub fn by_symbol(&self, network: Network, symbol: &str) -> Option<&Instrument> {
        let entry = self.networks.get(&network)?;
        entry
            .by_symbol
            .get(symbol)
            .map(|&index| &entry.instruments[index])
    }

    /// Instruments enumerated by `protocol`, by network then declaration order.
    pub fn instruments_for_protocol<'a>(&'a self, protocol: &'a str) -> impl Iterator<Item = &'a Instrument> + 'a {
        self.networks
            .values()
            .flat_map(|entry| entry.instruments.iter())
            .filter(move |instrument| instrument.protocol.as_deref() == Some(protocol))
    }

    pub fn protocols(&self) -> BTreeSet<&str> {
        self.networks
            .values()
            .flat_map(|entry| entry.instruments.iter())
            .filter_map(|instrument| instrument.protocol.as_deref())
            .collect()
    }
}

fn referenced_tokens(kind: &InstrumentKind) -> Vec<&Address> {
    match kind {
        InstrumentKind::PlainToken | InstrumentKind::LiquidityPoolShare { .. } => Vec::new(),
        InstrumentKind::PrincipalToken {
            underlying,
            standardized_yield,
            ..
        } => std::iter::once(underlying)
            .chain(standardized_yield.as_ref())
            .collect(),
        InstrumentKind::VaultShare { asset } => vec![asset],
    }
}
