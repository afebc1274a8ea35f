//! Core-side handler for the external payment collaborator.
//!
//! Card and bank rails live elsewhere; they report captures, releases and
//! refunds here, and this module keeps escrows, orders and requests
//! consistent with those reports.

use bazaar_storage::{
    Escrow, EscrowId, EscrowStatus, MarketStorage, Order, OrderId, OrderStatus, ProductId,
    RequestStatus, UserId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::auth::{require, Caller};
use crate::error::{ConflictKind, MarketError, Result};
use crate::fees::order_platform_fee;
use crate::requests::transition;
use crate::txn::finish;
use crate::Context;

/// A catalog sale reported by the payment collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSale {
    pub seller_id: UserId,
    pub buyer_id: Option<UserId>,
    pub product_id: ProductId,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_at: OffsetDateTime,
}

fn escrow_transition(escrow: &Escrow, next: EscrowStatus) -> Result<Escrow> {
    if escrow.status.is_terminal() {
        return Err(ConflictKind::EscrowTerminal.into());
    }
    if !escrow.status.can_transition_to(next) {
        return Err(ConflictKind::InvalidTransition {
            entity: "escrow",
            from: escrow.status.as_str(),
            to: next.as_str(),
        }
        .into());
    }
    let mut moved = escrow.clone();
    moved.status = next;
    Ok(moved)
}

pub struct PaymentCapture<S> {
    ctx: Context<S>,
}

impl<S: MarketStorage> PaymentCapture<S> {
    pub(crate) fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    async fn seller_level(&self, seller_id: UserId) -> Result<u8> {
        Ok(self
            .ctx
            .storage
            .get_seller(seller_id)
            .await?
            .map_or(0, |p| p.verification_level))
    }

    #[allow(clippy::too_many_arguments)]
    fn paid_order(
        &self,
        seller_id: UserId,
        buyer_id: Option<UserId>,
        product_id: ProductId,
        escrow_id: Option<EscrowId>,
        amount: i64,
        seller_level: u8,
        paid_at: OffsetDateTime,
    ) -> Result<Order> {
        Ok(Order {
            id: OrderId::new(),
            seller_id,
            buyer_id,
            product_id,
            escrow_id,
            amount,
            platform_fee: order_platform_fee(&self.ctx.config, amount, seller_level)?,
            seller_level,
            status: OrderStatus::Paid,
            paid_at: Some(paid_at),
            created_at: self.ctx.clock.now(),
            version: 0,
        })
    }

    /// PENDING → FUNDED, recording the engagement as a PAID order whose
    /// platform fee is fixed from the seller's level right now.
    pub async fn escrow_funded(
        &self,
        caller: &Caller,
        escrow_id: EscrowId,
        captured_at: OffsetDateTime,
    ) -> Result<(Escrow, Order)> {
        require(caller.is_platform(), "only the platform may report captures")?;
        let storage = self.ctx.storage.as_ref();
        let escrow = storage.get_escrow(escrow_id).await?;
        let mut funded = escrow_transition(&escrow, EscrowStatus::Funded)?;
        funded.funded_at = Some(captured_at);

        let level = self.seller_level(escrow.seller_id).await?;
        let order = self.paid_order(
            escrow.seller_id,
            Some(escrow.buyer_id),
            escrow.request_id.cast(),
            Some(escrow.id),
            escrow.amount,
            level,
            captured_at,
        )?;

        let mut snap = storage.begin_snapshot().await?;
        let staged = async {
            funded.version = storage.update_escrow(&mut snap, funded.clone()).await?;
            storage.insert_order(&mut snap, order.clone()).await?;
            Ok::<_, MarketError>(())
        }
        .await;
        finish(storage, snap, staged).await?;

        info!(
            escrow_id = %escrow_id,
            order_id = %order.id,
            amount = order.amount,
            platform_fee = order.platform_fee,
            seller_level = level,
            "escrow funded"
        );
        Ok((funded, order))
    }

    /// Record a PAID catalog order. The fee is fixed the same way as for
    /// escrowed engagements.
    pub async fn record_product_sale(&self, caller: &Caller, sale: ProductSale) -> Result<Order> {
        require(caller.is_platform(), "only the platform may record sales")?;
        if sale.amount <= 0 {
            return Err(MarketError::validation("sale amount must be positive"));
        }
        let level = self.seller_level(sale.seller_id).await?;
        let order = self.paid_order(
            sale.seller_id,
            sale.buyer_id,
            sale.product_id,
            None,
            sale.amount,
            level,
            sale.paid_at,
        )?;

        let storage = self.ctx.storage.as_ref();
        let mut snap = storage.begin_snapshot().await?;
        let staged = storage
            .insert_order(&mut snap, order.clone())
            .await
            .map_err(MarketError::from);
        finish(storage, snap, staged).await?;

        info!(order_id = %order.id, seller_id = %order.seller_id, amount = order.amount, "sale recorded");
        Ok(order)
    }

    /// FUNDED → RELEASED; the request completes in the same snapshot.
    pub async fn escrow_released(&self, caller: &Caller, escrow_id: EscrowId) -> Result<Escrow> {
        require(caller.is_platform(), "only the platform may release escrow")?;
        let storage = self.ctx.storage.as_ref();
        let escrow = storage.get_escrow(escrow_id).await?;
        let now = self.ctx.clock.now();
        let mut released = escrow_transition(&escrow, EscrowStatus::Released)?;
        released.closed_at = Some(now);

        let request = storage.get_request(escrow.request_id).await?;
        let mut completed = transition(&request, RequestStatus::Completed)?;
        completed.updated_at = now;

        let mut snap = storage.begin_snapshot().await?;
        let staged = async {
            released.version = storage.update_escrow(&mut snap, released.clone()).await?;
            storage.update_request(&mut snap, completed).await?;
            Ok::<_, MarketError>(())
        }
        .await;
        finish(storage, snap, staged).await?;

        info!(escrow_id = %escrow_id, request_id = %escrow.request_id, "escrow released");
        Ok(released)
    }

    /// PENDING or FUNDED → REFUNDED. Orders paid through the escrow become
    /// REFUNDED and drop out of settlement.
    pub async fn escrow_refunded(&self, caller: &Caller, escrow_id: EscrowId) -> Result<Escrow> {
        require(caller.is_platform(), "only the platform may refund escrow")?;
        let storage = self.ctx.storage.as_ref();
        let escrow = storage.get_escrow(escrow_id).await?;
        let mut refunded = escrow_transition(&escrow, EscrowStatus::Refunded)?;
        refunded.closed_at = Some(self.ctx.clock.now());

        let orders: Vec<Order> = storage
            .list_orders_by_escrow(escrow_id)
            .await?
            .into_iter()
            .filter(|o| o.status == OrderStatus::Paid)
            .map(|mut o| {
                o.status = OrderStatus::Refunded;
                o
            })
            .collect();

        let mut snap = storage.begin_snapshot().await?;
        let staged = async {
            refunded.version = storage.update_escrow(&mut snap, refunded.clone()).await?;
            for order in &orders {
                storage.update_order(&mut snap, order.clone()).await?;
            }
            Ok::<_, MarketError>(())
        }
        .await;
        finish(storage, snap, staged).await?;

        info!(escrow_id = %escrow_id, refunded_orders = orders.len(), "escrow refunded");
        Ok(refunded)
    }
}
