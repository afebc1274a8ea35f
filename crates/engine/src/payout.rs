//! Hands settled payouts to an external funds-transfer provider.
//!
//! ```text
//! PENDING | FAILED --dispatch--> PROCESSING --provider ok--> PAID
//!                                           --provider err-> FAILED
//! PROCESSING (abandoned) --dispatch--> PROCESSING
//! PROCESSING --mark_failed--> FAILED
//! ```
//!
//! The PROCESSING write is the compare-and-swap: two dispatchers racing on
//! one settlement cannot both reach the provider.

use std::sync::Arc;

use async_trait::async_trait;
use bazaar_storage::{MarketStorage, Settlement, SettlementId, SettlementStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::auth::{require, Caller};
use crate::config::RetryPolicy;
use crate::error::{BusinessRuleKind, ConflictKind, MarketError, Result};
use crate::notify::NotificationEvent;
use crate::txn::finish;
use crate::Context;

/// One transfer, exactly as sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInstruction {
    pub destination_account_ref: String,
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PayoutError {
    #[error("payout provider unavailable: {0}")]
    Unavailable(String),
    #[error("payout rejected by provider: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PayoutProvider: Send + Sync {
    async fn transfer(&self, instruction: TransferInstruction)
        -> Result<TransferReceipt, PayoutError>;
}

/// `settlement-<hex sha256 of the settlement id>`. Stable across retries so
/// the provider can deduplicate.
pub fn idempotency_key(id: SettlementId) -> String {
    let digest = Sha256::digest(id.as_uuid().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("settlement-{hex}")
}

const OUTCOME_WRITE_ATTEMPTS: u32 = 3;

pub struct PayoutDispatcher<S> {
    ctx: Context<S>,
    provider: Arc<dyn PayoutProvider>,
}

impl<S: MarketStorage> PayoutDispatcher<S> {
    pub(crate) fn new(ctx: Context<S>, provider: Arc<dyn PayoutProvider>) -> Self {
        Self { ctx, provider }
    }

    /// Issue exactly one transfer for a PENDING or FAILED settlement, or for
    /// a PROCESSING one abandoned longer than `payout_stale_after_secs`.
    pub async fn dispatch(&self, caller: &Caller, id: SettlementId) -> Result<Settlement> {
        require(caller.is_platform(), "only the platform may dispatch payouts")?;
        let storage = self.ctx.storage.as_ref();
        let now = self.ctx.clock.now();
        let current = storage.get_settlement(id).await?;
        match current.status {
            SettlementStatus::Pending | SettlementStatus::Failed => {}
            SettlementStatus::Processing if self.is_abandoned(&current, now) => {
                warn!(
                    settlement_id = %id,
                    since = ?current.processing_since,
                    "reclaiming abandoned payout"
                );
            }
            SettlementStatus::Processing => return Err(ConflictKind::PayoutInProgress.into()),
            SettlementStatus::Paid => {
                return Err(ConflictKind::InvalidTransition {
                    entity: "settlement",
                    from: SettlementStatus::Paid.as_str(),
                    to: SettlementStatus::Processing.as_str(),
                }
                .into())
            }
        }

        let account = storage
            .get_seller(current.seller_id)
            .await?
            .and_then(|p| p.payout_account_ref);
        if account.is_none() && current.payout_amount != 0 {
            return Err(BusinessRuleKind::NoPayoutAccount.into());
        }

        let mut processing = current.clone();
        processing.status = SettlementStatus::Processing;
        processing.failure_reason = None;
        processing.processing_since = Some(now);
        processing.version = match self.write(processing.clone()).await {
            Ok(version) => version,
            Err(e) if e.is_conflict(&ConflictKind::ConcurrentModification) => {
                return Err(ConflictKind::PayoutInProgress.into())
            }
            Err(e) => return Err(e),
        };

        let outcome = match account {
            Some(destination_account_ref) if processing.payout_amount != 0 => {
                let instruction = TransferInstruction {
                    destination_account_ref,
                    amount: processing.payout_amount,
                    currency: processing.currency.clone(),
                    idempotency_key: idempotency_key(id),
                };
                self.provider.transfer(instruction).await.map(Some)
            }
            _ => Ok(None),
        };

        match outcome {
            Ok(receipt) => {
                let paid_at = self.ctx.clock.now();
                let transfer_id = receipt.map(|r| r.transfer_id);
                let done = self
                    .record_outcome(processing, |s| {
                        s.status = SettlementStatus::Paid;
                        s.payout_date = Some(paid_at);
                        s.transfer_id = transfer_id.clone();
                        s.failure_reason = None;
                        s.processing_since = None;
                    })
                    .await?;
                info!(
                    settlement_id = %id,
                    amount = done.payout_amount,
                    transfer_id = done.transfer_id.as_deref().unwrap_or("-"),
                    "payout sent"
                );
                self.ctx.notifier.notify(NotificationEvent::SettlementPaid {
                    settlement_id: id,
                    seller_id: done.seller_id,
                    amount: done.payout_amount,
                    currency: done.currency.clone(),
                });
                Ok(done)
            }
            Err(e) => {
                let reason = e.to_string();
                self.record_outcome(processing, |s| {
                    s.status = SettlementStatus::Failed;
                    s.failure_reason = Some(reason.clone());
                    s.processing_since = None;
                })
                .await?;
                warn!(settlement_id = %id, error = %e, "payout failed");
                Err(MarketError::ExternalDependency(reason))
            }
        }
    }

    /// Release a PROCESSING settlement whose dispatcher is known to be gone,
    /// so it can be dispatched again.
    pub async fn mark_failed(
        &self,
        caller: &Caller,
        id: SettlementId,
        reason: &str,
    ) -> Result<Settlement> {
        require(caller.is_platform(), "only the platform may fail payouts")?;
        let mut settlement = self.ctx.storage.get_settlement(id).await?;
        if settlement.status != SettlementStatus::Processing {
            return Err(ConflictKind::InvalidTransition {
                entity: "settlement",
                from: settlement.status.as_str(),
                to: SettlementStatus::Failed.as_str(),
            }
            .into());
        }
        settlement.status = SettlementStatus::Failed;
        settlement.failure_reason = Some(reason.to_string());
        settlement.processing_since = None;
        settlement.version = self.write(settlement.clone()).await?;
        warn!(settlement_id = %id, reason, "payout marked failed");
        Ok(settlement)
    }

    /// `dispatch`, retrying provider failures with exponential backoff.
    /// Every other error is returned immediately.
    pub async fn dispatch_with_retry(
        &self,
        caller: &Caller,
        id: SettlementId,
        policy: &RetryPolicy,
    ) -> Result<Settlement> {
        let mut attempt = 0;
        loop {
            match self.dispatch(caller, id).await {
                Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        settlement_id = %id,
                        attempt = attempt + 1,
                        ?delay,
                        "retrying payout"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn is_abandoned(&self, settlement: &Settlement, now: OffsetDateTime) -> bool {
        settlement
            .processing_since
            .map_or(true, |since| now - since >= self.ctx.config.payout_stale_after())
    }

    /// Write the provider's answer. A failed write re-reads the row and
    /// reapplies the answer; only an already PAID row is left as is.
    async fn record_outcome(
        &self,
        mut row: Settlement,
        apply: impl Fn(&mut Settlement),
    ) -> Result<Settlement> {
        let mut attempt = 1;
        loop {
            let mut next = row.clone();
            apply(&mut next);
            match self.write(next.clone()).await {
                Ok(version) => {
                    next.version = version;
                    return Ok(next);
                }
                Err(e) if attempt < OUTCOME_WRITE_ATTEMPTS => {
                    warn!(settlement_id = %row.id, attempt, error = %e, "retrying payout status write");
                    attempt += 1;
                    row = self.ctx.storage.get_settlement(row.id).await?;
                    if row.status == SettlementStatus::Paid {
                        return Ok(row);
                    }
                }
                Err(e) => {
                    error!(
                        settlement_id = %row.id,
                        error = %e,
                        "payout outcome not recorded; settlement stays PROCESSING until reclaimed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn write(&self, settlement: Settlement) -> Result<i64> {
        let storage = self.ctx.storage.as_ref();
        let mut snap = storage.begin_snapshot().await?;
        let staged = storage
            .update_settlement(&mut snap, settlement)
            .await
            .map_err(MarketError::from);
        finish(storage, snap, staged).await
    }
}
