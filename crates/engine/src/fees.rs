//! Fee arithmetic over integer minor units.
//!
//! Rates are `rust_decimal::Decimal`; every product is rounded to whole
//! minor units with `MidpointAwayFromZero`, so a half unit goes to the
//! party whose share is computed first. No `f64` anywhere.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::config::MarketConfig;
use crate::error::{MarketError, Result};

/// `round(amount × rate)` in minor units, with overflow checking.
pub fn apply_rate(amount: i64, rate: Decimal) -> Result<i64> {
    let product = Decimal::from(amount)
        .checked_mul(rate)
        .ok_or_else(|| MarketError::validation("fee multiplication overflow"))?;
    product
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| MarketError::validation(format!("fee {product} does not fit in i64")))
}

/// How a verification fee divides between verifier and platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub fee: i64,
    pub verifier_share: i64,
    pub platform_share: i64,
}

/// Verifier share is rounded; the platform keeps the remainder, so the two
/// always add back up to `fee`.
pub fn split_verification_fee(fee: i64, verifier_share_rate: Decimal) -> Result<FeeSplit> {
    let verifier_share = apply_rate(fee, verifier_share_rate)?;
    Ok(FeeSplit {
        fee,
        verifier_share,
        platform_share: fee - verifier_share,
    })
}

/// Price and split for a verification `level`. Level 0 is free.
pub fn verification_quote(config: &MarketConfig, level: u8) -> Result<FeeSplit> {
    let fee = config
        .verification_prices
        .price(level)
        .ok_or_else(|| MarketError::validation(format!("verification level {level} not in 0-3")))?;
    split_verification_fee(fee, config.verifier_share_rate)
}

/// Platform fee rate for a seller at `seller_level`.
pub fn platform_fee_rate(config: &MarketConfig, seller_level: u8) -> Decimal {
    if seller_level >= config.verified_level_threshold {
        config.verified_fee_rate
    } else {
        config.platform_fee_rate
    }
}

/// Platform fee for one order, fixed at capture time.
pub fn order_platform_fee(config: &MarketConfig, amount: i64, seller_level: u8) -> Result<i64> {
    apply_rate(amount, platform_fee_rate(config, seller_level))
}

/// Checked sum of minor-unit amounts.
pub fn checked_sum(amounts: impl IntoIterator<Item = i64>) -> Result<i64> {
    amounts.into_iter().try_fold(0i64, |acc, amount| {
        acc.checked_add(amount)
            .ok_or_else(|| MarketError::validation("amount sum overflow"))
    })
}

/// `amount - fee`, or a validation error on overflow.
pub fn checked_net(amount: i64, fee: i64) -> Result<i64> {
    amount
        .checked_sub(fee)
        .ok_or_else(|| MarketError::validation("net amount overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_price_table_splits_seventy_thirty() {
        let config = MarketConfig::default();
        let expected = [(1, 50, 35, 15), (2, 150, 105, 45), (3, 500, 350, 150)];
        for (level, fee, verifier, platform) in expected {
            let split = verification_quote(&config, level).unwrap();
            assert_eq!(split.fee, fee, "level {level}");
            assert_eq!(split.verifier_share, verifier, "level {level}");
            assert_eq!(split.platform_share, platform, "level {level}");
        }
    }

    #[test]
    fn automated_level_is_free() {
        let split = verification_quote(&MarketConfig::default(), 0).unwrap();
        assert_eq!(split, FeeSplit { fee: 0, verifier_share: 0, platform_share: 0 });
    }

    #[test]
    fn unknown_level_is_validation_error() {
        let err = verification_quote(&MarketConfig::default(), 4).unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }

    #[test]
    fn half_unit_rounds_towards_verifier() {
        // 25 × 0.70 = 17.5
        let split = split_verification_fee(25, Decimal::new(70, 2)).unwrap();
        assert_eq!(split.verifier_share, 18);
        assert_eq!(split.platform_share, 7);
    }

    #[test]
    fn verified_sellers_get_discounted_rate() {
        let config = MarketConfig::default();
        assert_eq!(order_platform_fee(&config, 100_000, 0).unwrap(), 15_000);
        assert_eq!(order_platform_fee(&config, 100_000, 1).unwrap(), 15_000);
        assert_eq!(order_platform_fee(&config, 100_000, 2).unwrap(), 12_000);
        assert_eq!(order_platform_fee(&config, 100_000, 3).unwrap(), 12_000);
    }

    #[test]
    fn sum_overflow_is_reported() {
        assert_eq!(checked_sum([1, 2, 3]).unwrap(), 6);
        assert!(checked_sum([i64::MAX, 1]).is_err());
    }

    #[test]
    fn net_overflow_is_reported() {
        assert_eq!(checked_net(100_000, 15_000).unwrap(), 85_000);
        assert!(matches!(checked_net(i64::MIN, 1), Err(MarketError::Validation(_))));
    }
}
