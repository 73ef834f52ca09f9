use thiserror::Error;

/// Validation and contract errors exposed by `valor-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("address must be 0x followed by 40 hex characters: '{value}'")]
    InvalidAddress { value: String },

    #[error("invalid network '{value}', expected one of ethereum, base, arbitrum")]
    InvalidNetwork { value: String },

    #[error("token symbol cannot be empty")]
    EmptySymbol,
    #[error("token decimals {decimals} exceed max {max}")]
    DecimalsTooLarge { decimals: u32, max: u32 },

    #[error("amount {value} cannot be represented as a decimal")]
    AmountOutOfRange { value: u128 },
    #[error("field '{field}' must be greater than zero")]
    NonPositiveValue { field: &'static str },

    #[error("invalid value '{value}' for {key}")]
    InvalidConfig { key: &'static str, value: String },
    #[error("engine requires a {component}")]
    MissingComponent { component: &'static str },

    #[error("duplicate instrument '{symbol}' on {network}")]
    DuplicateInstrument { network: String, symbol: String },
    #[error("network {network} has no reference asset '{symbol}' in the registry")]
    MissingReferenceAsset { network: String, symbol: String },
    #[error("instrument '{symbol}' on {network} references unknown token {address}")]
    DanglingReference {
        network: String,
        symbol: String,
        address: String,
    },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
