use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};

/// Tunable marketplace policy. Every field has a default, so a config file
/// only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// ISO 4217 code passed to the payout provider.
    pub currency: String,
    pub platform_fee_rate: Decimal,
    /// Rate for sellers whose verification level has reached
    /// `verified_level_threshold` when the order is paid.
    pub verified_fee_rate: Decimal,
    pub verified_level_threshold: u8,
    pub verifier_share_rate: Decimal,
    pub verification_prices: VerificationPrices,
    pub max_page_size: usize,
    /// Sellers settled in parallel by `run_all`.
    pub settlement_concurrency: usize,
    /// Capacity of the notification outbox queue.
    pub notification_queue: usize,
    pub payout_retry: RetryPolicy,
    /// A PROCESSING payout older than this is presumed abandoned and may be
    /// dispatched again under the same idempotency key.
    pub payout_stale_after_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            platform_fee_rate: Decimal::new(15, 2),
            verified_fee_rate: Decimal::new(12, 2),
            verified_level_threshold: 2,
            verifier_share_rate: Decimal::new(70, 2),
            verification_prices: VerificationPrices::default(),
            max_page_size: 100,
            settlement_concurrency: 4,
            notification_queue: 1024,
            payout_retry: RetryPolicy::default(),
            payout_stale_after_secs: 900,
        }
    }
}

impl MarketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(MarketError::validation(format!(
                "currency must be a 3-letter ISO code, got {:?}",
                self.currency
            )));
        }
        for (name, rate) in [
            ("platform_fee_rate", self.platform_fee_rate),
            ("verified_fee_rate", self.verified_fee_rate),
            ("verifier_share_rate", self.verifier_share_rate),
        ] {
            if rate < Decimal::ZERO || rate > Decimal::ONE {
                return Err(MarketError::validation(format!(
                    "{name} must be within [0, 1], got {rate}"
                )));
            }
        }
        for level in 1..=3 {
            match self.verification_prices.price(level) {
                Some(price) if price > 0 => {}
                _ => {
                    return Err(MarketError::validation(format!(
                        "verification price for level {level} must be positive"
                    )))
                }
            }
        }
        if self.max_page_size == 0 {
            return Err(MarketError::validation("max_page_size must be positive"));
        }
        if self.settlement_concurrency == 0 {
            return Err(MarketError::validation(
                "settlement_concurrency must be positive",
            ));
        }
        if self.notification_queue == 0 {
            return Err(MarketError::validation("notification_queue must be positive"));
        }
        if self.payout_stale_after_secs == 0 {
            return Err(MarketError::validation(
                "payout_stale_after_secs must be positive",
            ));
        }
        self.payout_retry.validate()
    }

    pub fn payout_stale_after(&self) -> time::Duration {
        let secs = i64::try_from(self.payout_stale_after_secs).unwrap_or(i64::MAX);
        time::Duration::seconds(secs)
    }
}

/// Fixed verification price table, in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationPrices {
    pub level_1: i64,
    pub level_2: i64,
    pub level_3: i64,
}

impl Default for VerificationPrices {
    fn default() -> Self {
        Self {
            level_1: 50,
            level_2: 150,
            level_3: 500,
        }
    }
}

impl VerificationPrices {
    /// `Some(0)` for the automated level, `None` for unknown levels.
    pub fn price(&self, level: u8) -> Option<i64> {
        match level {
            0 => Some(0),
            1 => Some(self.level_1),
            2 => Some(self.level_2),
            3 => Some(self.level_3),
            _ => None,
        }
    }
}

/// Exponential backoff for retryable payout failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based):
    /// `initial_backoff × 2^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(MarketError::validation(
                "payout_retry.max_attempts must be at least 1",
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(MarketError::validation(
                "payout_retry.initial_backoff_ms exceeds max_backoff_ms",
            ));
        }
        Ok(())
    }
}
