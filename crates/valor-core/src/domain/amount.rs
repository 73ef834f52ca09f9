//! Minor-unit <-> decimal conversions.
//!
//! Every on-chain amount is an integer in the token's minor unit. Ratios and
//! rates are computed in [`Decimal`] and converted back by truncation, never by
//! rounding, so a valuation never overstates what a holder could redeem.

use alloy_primitives::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

/// Largest scale `rust_decimal` can represent.
pub const MAX_DECIMALS: u32 = 28;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount {value} exceeds decimal precision")]
    OutOfRange { value: u128 },
    #[error("decimals {decimals} exceed max 28")]
    UnsupportedDecimals { decimals: u32 },
    #[error("division by zero while computing '{context}'")]
    DivisionByZero { context: &'static str },
    #[error("arithmetic overflow while computing '{context}'")]
    Overflow { context: &'static str },
    #[error("negative result while computing '{context}'")]
    Negative { context: &'static str },
}

/// Converts a raw minor-unit amount into whole tokens.
pub fn normalize(amount: u128, decimals: u32) -> Result<Decimal, AmountError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountError::UnsupportedDecimals { decimals });
    }
    let mantissa = i128::try_from(amount).map_err(|_| AmountError::OutOfRange { value: amount })?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map_err(|_| AmountError::OutOfRange { value: amount })
}

/// Converts whole tokens back into minor units, truncating any remainder.
pub fn to_minor_units(value: Decimal, decimals: u32) -> Result<u128, AmountError> {
    let context = "minor unit conversion";
    if value.is_sign_negative() && !value.is_zero() {
        return Err(AmountError::Negative { context });
    }
    let scaled = value
        .checked_mul(pow10(decimals)?)
        .ok_or(AmountError::Overflow { context })?;
    scaled.trunc().to_u128().ok_or(AmountError::Overflow { context })
}

/// `10^decimals` as a decimal.
pub fn pow10(decimals: u32) -> Result<Decimal, AmountError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountError::UnsupportedDecimals { decimals });
    }
    Decimal::try_from_i128_with_scale(10_i128.pow(decimals), 0)
        .map_err(|_| AmountError::UnsupportedDecimals { decimals })
}

/// `numerator / denominator` computed in decimal arithmetic.
pub fn ratio(numerator: u128, denominator: u128) -> Result<Decimal, AmountError> {
    let context = "ratio";
    if denominator == 0 {
        return Err(AmountError::DivisionByZero { context });
    }
    normalize(numerator, 0)?
        .checked_div(normalize(denominator, 0)?)
        .ok_or(AmountError::Overflow { context })
}

/// Holder's share of an outstanding leg: `total_leg * holder / total_supply`, truncated.
///
/// The product is taken in 256 bits, so reserves and supplies of any `u128`
/// size are exact and truncation happens exactly once.
pub fn pro_rata(total_leg: u128, holder: u128, total_supply: u128) -> Result<u128, AmountError> {
    let context = "pro-rata leg";
    if total_supply == 0 {
        return Err(AmountError::DivisionByZero { context });
    }
    let leg = U256::from(total_leg) * U256::from(holder) / U256::from(total_supply);
    u128::try_from(leg).map_err(|_| AmountError::Overflow { context })
}

/// Moves a raw amount between decimal scales, truncating when scaling down.
pub fn rescale(amount: u128, from_decimals: u32, to_decimals: u32) -> Result<u128, AmountError> {
    let context = "decimal rescale";
    let shift = |decimals: u32| {
        10_u128
            .checked_pow(decimals)
            .ok_or(AmountError::UnsupportedDecimals { decimals })
    };
    if to_decimals >= from_decimals {
        amount
            .checked_mul(shift(to_decimals - from_decimals)?)
            .ok_or(AmountError::Overflow { context })
    } else {
        Ok(amount / shift(from_decimals - to_decimals)?)
    }
}

/// Rate of `buy` per `sell`, each side normalized by its own decimals.
pub fn realized_rate(
    sell_amount: u128,
    sell_decimals: u32,
    buy_amount: u128,
    buy_decimals: u32,
) -> Result<Decimal, AmountError> {
    let sell = normalize(sell_amount, sell_decimals)?;
    if sell.is_zero() {
        return Err(AmountError::DivisionByZero { context: "realized rate" });
    }
    normalize(buy_amount, buy_decimals)?
        .checked_div(sell)
        .ok_or(AmountError::Overflow { context: "realized rate" })
}

/// Applies `rate` to a sell amount and returns the buy amount in minor units.
pub fn apply_rate(
    sell_amount: u128,
    sell_decimals: u32,
    rate: Decimal,
    buy_decimals: u32,
) -> Result<u128, AmountError> {
    let value = normalize(sell_amount, sell_decimals)?
        .checked_mul(rate)
        .ok_or(AmountError::Overflow { context: "rate application" })?;
    to_minor_units(value, buy_decimals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const WAD: u128 = 1_000_000_000_000_000_000;

    #[test]
    fn pro_rata_splits_exactly_for_round_shares() {
        assert_eq!(pro_rata(500_000, 100_000, 1_000_000), Ok(50_000));
        assert_eq!(
            pro_rata(500_000 * WAD, 100_000 * WAD, 1_000_000 * WAD),
            Ok(50_000 * WAD)
        );
    }

    #[test]
    fn pro_rata_truncates_instead_of_rounding() {
        // 2/3 of 10 = 6.66.. -> 6
        assert_eq!(pro_rata(10, 2, 3), Ok(6));
    }

    #[test]
    fn pro_rata_handles_reserves_beyond_decimal_precision() {
        // 1e29 outstanding, holder owns 1% of a 1e20 supply.
        assert_eq!(pro_rata(10_u128.pow(29), 10_u128.pow(18), 10_u128.pow(20)), Ok(10_u128.pow(27)));
        assert_eq!(pro_rata(u128::MAX, 1, 2), Ok(u128::MAX / 2));
        assert_eq!(pro_rata(u128::MAX, u128::MAX, u128::MAX), Ok(u128::MAX));
    }

    #[test]
    fn pro_rata_reports_overflow_when_holder_exceeds_supply() {
        assert_eq!(
            pro_rata(u128::MAX, 3, 2),
            Err(AmountError::Overflow { context: "pro-rata leg" })
        );
    }

    #[test]
    fn rescale_moves_between_decimal_scales() {
        assert_eq!(rescale(1_500_000, 6, 18), Ok(1_500_000 * WAD));
        assert_eq!(rescale(1_999_999_999_999, 18, 6), Ok(1));
        assert_eq!(rescale(10_u128.pow(30), 18, 18), Ok(10_u128.pow(30)));
        assert!(matches!(rescale(u128::MAX, 0, 1), Err(AmountError::Overflow { .. })));
    }

    #[test]
    fn pro_rata_rejects_empty_supply() {
        assert!(matches!(
            pro_rata(10, 1, 0),
            Err(AmountError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn realized_rate_respects_both_precisions() {
        // 2 tokens (18 dp) -> 1.998 USDC (6 dp)
        let rate = realized_rate(2 * WAD, 18, 1_998_000, 6).expect("rate");
        assert_eq!(rate, dec!(0.999));
    }

    #[test]
    fn apply_rate_truncates_to_target_minor_unit() {
        // 1 token * 0.9999999 -> 0.999999 USDC
        assert_eq!(apply_rate(WAD, 18, dec!(0.9999999), 6), Ok(999_999));
    }

    #[test]
    fn normalize_rejects_unsupported_scale() {
        assert!(normalize(1, 29).is_err());
    }
}
