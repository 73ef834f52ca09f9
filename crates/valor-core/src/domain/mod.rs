//! # Domain Models
//!
//! Canonical types shared by the valuation engine.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Network`] | Supported chains and their venue identifiers |
//! | [`Address`] | Validated, case-normalized EVM address |
//! | [`Token`] / [`Instrument`] | Registry entries and how they are valued |
//! | [`Quote`] | Raw venue quote |
//! | [`ConversionResult`] | Value of an amount in the reference asset |
//! | [`Position`] / [`ProtocolBalances`] | Adapter output |
//!
//! All monetary amounts are `u128` minor units. Decimal math lives in
//! [`amount`].

mod address;
pub mod amount;
mod models;
mod network;

pub use address::Address;
pub use amount::AmountError;
pub use models::{
    ConversionMethod, ConversionResult, Instrument, InstrumentClass, InstrumentKind, Leg,
    NetworkBalances, Position, ProtocolBalances, Quote, RewardEntry, Token,
};
pub use network::Network;

pub(crate) use models::u128_string;
