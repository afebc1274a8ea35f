//! Per-seller period settlement.
//!
//! A settlement closes one half-open period for one seller:
//!
//! ```text
//! total_amount          = Σ order.amount                 (PAID orders)
//! platform_fee          = Σ order.platform_fee           (fixed at capture)
//! verification_earnings = Σ verification.verifier_share  (APPROVED/COMPLETED)
//! payout_amount         = total_amount - platform_fee + verification_earnings
//! ```
//!
//! Idempotency comes from the storage constraints on (seller, period): a
//! second run for the same period, concurrent or not, cannot commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bazaar_storage::{
    MarketStorage, Order, Period, ProductId, Settlement, SettlementId, SettlementItem,
    SettlementStatus, UserId, Verification,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::{require, Caller};
use crate::error::{ConflictKind, MarketError, Result};
use crate::fees::{checked_net, checked_sum};
use crate::txn::finish;
use crate::Context;

/// A committed settlement and its per-product breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementRun {
    pub settlement: Settlement,
    pub items: Vec<SettlementItem>,
}

/// Outcome of [`SettlementCalculator::run_all`].
#[derive(Debug, Default, Serialize)]
pub struct RunAllReport {
    pub settled: Vec<SettlementRun>,
    /// Sellers whose period was already (partly) settled.
    pub skipped: Vec<UserId>,
    pub failed: Vec<(UserId, String)>,
}

/// One item per product, ordered by product id.
fn itemize(settlement_id: SettlementId, orders: &[Order]) -> Result<Vec<SettlementItem>> {
    let mut by_product: BTreeMap<ProductId, Vec<&Order>> = BTreeMap::new();
    for order in orders {
        by_product.entry(order.product_id).or_default().push(order);
    }
    by_product
        .into_iter()
        .map(|(product_id, orders)| {
            let amount = checked_sum(orders.iter().map(|o| o.amount))?;
            let platform_fee = checked_sum(orders.iter().map(|o| o.platform_fee))?;
            Ok(SettlementItem {
                settlement_id,
                product_id,
                order_count: u32::try_from(orders.len())
                    .map_err(|_| MarketError::validation("too many orders for one product"))?,
                amount,
                platform_fee,
                payout_amount: checked_net(amount, platform_fee)?,
            })
        })
        .collect()
}

pub struct SettlementCalculator<S> {
    ctx: Context<S>,
}

impl<S> Clone for SettlementCalculator<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: MarketStorage> SettlementCalculator<S> {
    pub(crate) fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    /// Compute and persist the settlement of `seller_id` for `period`.
    pub async fn run(
        &self,
        caller: &Caller,
        seller_id: UserId,
        period: Period,
    ) -> Result<SettlementRun> {
        require(caller.is_platform(), "only the platform may run settlements")?;
        if period.is_empty() {
            return Err(MarketError::validation(format!(
                "settlement period is empty: {} is not before {}",
                period.start, period.end
            )));
        }
        self.check_unsettled(seller_id, period).await?;

        let storage = self.ctx.storage.as_ref();
        let orders = storage.list_paid_orders(seller_id, period).await?;
        let reviews = storage
            .list_completed_verifications(seller_id, period)
            .await?;
        let run = self.compute(seller_id, period, &orders, &reviews)?;

        let mut snap = storage.begin_snapshot().await?;
        let staged = storage
            .insert_settlement(&mut snap, run.settlement.clone(), run.items.clone())
            .await
            .map_err(MarketError::from);
        finish(storage, snap, staged).await?;

        info!(
            settlement_id = %run.settlement.id,
            seller_id = %seller_id,
            orders = orders.len(),
            verifications = reviews.len(),
            payout_amount = run.settlement.payout_amount,
            "settlement created"
        );
        Ok(run)
    }

    async fn check_unsettled(&self, seller_id: UserId, period: Period) -> Result<()> {
        let existing = self.ctx.storage.list_settlements(seller_id).await?;
        for settlement in &existing {
            if settlement.period == period {
                return Err(ConflictKind::SettlementExists.into());
            }
            if settlement.period.overlaps(&period) {
                return Err(ConflictKind::SettlementPeriodOverlap.into());
            }
        }
        Ok(())
    }

    fn compute(
        &self,
        seller_id: UserId,
        period: Period,
        orders: &[Order],
        reviews: &[Verification],
    ) -> Result<SettlementRun> {
        let total_amount = checked_sum(orders.iter().map(|o| o.amount))?;
        let platform_fee = checked_sum(orders.iter().map(|o| o.platform_fee))?;
        let verification_earnings = checked_sum(reviews.iter().map(|v| v.verifier_share))?;
        let payout_amount = checked_net(total_amount, platform_fee)?
            .checked_add(verification_earnings)
            .ok_or_else(|| MarketError::validation("payout amount overflow"))?;
        debug!(
            seller_id = %seller_id,
            total_amount,
            platform_fee,
            verification_earnings,
            payout_amount,
            "settlement aggregated"
        );

        let id = SettlementId::new();
        let items = itemize(id, orders)?;
        let settlement = Settlement {
            id,
            seller_id,
            period,
            currency: self.ctx.config.currency.clone(),
            total_amount,
            platform_fee,
            verification_earnings,
            payout_amount,
            status: SettlementStatus::Pending,
            payout_date: None,
            transfer_id: None,
            failure_reason: None,
            processing_since: None,
            created_at: self.ctx.clock.now(),
            version: 0,
        };
        Ok(SettlementRun { settlement, items })
    }

    pub async fn get(&self, id: SettlementId) -> Result<Settlement> {
        Ok(self.ctx.storage.get_settlement(id).await?)
    }

    /// Oldest period first.
    pub async fn list(&self, seller_id: UserId) -> Result<Vec<Settlement>> {
        Ok(self.ctx.storage.list_settlements(seller_id).await?)
    }

    pub async fn items(&self, id: SettlementId) -> Result<Vec<SettlementItem>> {
        Ok(self.ctx.storage.list_settlement_items(id).await?)
    }

    /// The settlement already closing exactly `period` for `seller_id`.
    pub async fn find(&self, seller_id: UserId, period: Period) -> Result<Option<SettlementRun>> {
        let storage = self.ctx.storage.as_ref();
        match storage.find_settlement(seller_id, period).await? {
            Some(settlement) => {
                let items = storage.list_settlement_items(settlement.id).await?;
                Ok(Some(SettlementRun { settlement, items }))
            }
            None => Ok(None),
        }
    }

    /// Settle every seller with PAID orders or verification income in
    /// `period`, at most `settlement_concurrency` at a time.
    pub async fn run_all(&self, caller: &Caller, period: Period) -> Result<RunAllReport> {
        require(caller.is_platform(), "only the platform may run settlements")?;
        if period.is_empty() {
            return Err(MarketError::validation("settlement period is empty"));
        }
        let storage = self.ctx.storage.as_ref();
        let mut earners: BTreeSet<UserId> = storage
            .sellers_with_paid_orders(period)
            .await?
            .into_iter()
            .collect();
        earners.extend(storage.verifiers_with_completed_work(period).await?);

        let permits = Arc::new(Semaphore::new(self.ctx.config.settlement_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for seller_id in earners {
            let calculator = self.clone();
            let caller = *caller;
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (seller_id, calculator.run(&caller, seller_id, period).await)
            });
        }

        let mut report = RunAllReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (seller_id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "settlement task did not finish");
                    continue;
                }
            };
            match outcome {
                Ok(run) => report.settled.push(run),
                Err(MarketError::Conflict(
                    ConflictKind::SettlementExists | ConflictKind::SettlementPeriodOverlap,
                )) => {
                    debug!(seller_id = %seller_id, "period already settled; skipping");
                    report.skipped.push(seller_id);
                }
                Err(e) => {
                    warn!(seller_id = %seller_id, error = %e, "settlement failed");
                    report.failed.push((seller_id, e.to_string()));
                }
            }
        }
        report.settled.sort_by_key(|r| r.settlement.seller_id);
        report.skipped.sort();
        report.failed.sort_by_key(|(id, _)| *id);

        info!(
            settled = report.settled.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "settlement batch finished"
        );
        Ok(report)
    }
}
