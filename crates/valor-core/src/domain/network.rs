use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Canonical network identifiers used in the registry and in output keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ethereum,
    Base,
    Arbitrum,
}

impl Network {
    pub const ALL: [Self; 3] = [Self::Ethereum, Self::Base, Self::Arbitrum];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ethereum => "ethereum",
            Self::Base => "base",
            Self::Arbitrum => "arbitrum",
        }
    }

    pub const fn chain_id(self) -> u64 {
        match self {
            Self::Ethereum => 1,
            Self::Base => 8453,
            Self::Arbitrum => 42161,
        }
    }

    /// Path segment the quote venue uses for this network.
    pub const fn quote_api_slug(self) -> &'static str {
        match self {
            Self::Ethereum => "mainnet",
            Self::Base => "base",
            Self::Arbitrum => "arbitrum_one",
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ethereum" | "mainnet" => Ok(Self::Ethereum),
            "base" => Ok(Self::Base),
            "arbitrum" | "arbitrum_one" => Ok(Self::Arbitrum),
            other => Err(ValidationError::InvalidNetwork {
                value: other.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_venue_slugs_as_aliases() {
        assert_eq!("mainnet".parse::<Network>(), Ok(Network::Ethereum));
        assert_eq!(" Base ".parse::<Network>(), Ok(Network::Base));
        assert_eq!(Network::Ethereum.quote_api_slug(), "mainnet");
        assert!("solana".parse::<Network>().is_err());
    }
}
