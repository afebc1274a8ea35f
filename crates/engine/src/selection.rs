use bazaar_storage::{
    DevelopmentRequest, Escrow, EscrowId, EscrowStatus, MarketStorage, Proposal, ProposalId,
    ProposalStatus, RequestId, RequestStatus,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::{require, Caller};
use crate::error::{ConflictKind, MarketError, Result};
use crate::notify::NotificationEvent;
use crate::requests::transition;
use crate::txn::finish;
use crate::Context;

/// Outcome of a successful selection, as committed.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub request: DevelopmentRequest,
    pub proposal: Proposal,
    pub escrow: Escrow,
}

/// Accepts one proposal per request and opens its escrow.
pub struct SelectionCoordinator<S> {
    ctx: Context<S>,
}

impl<S: MarketStorage> SelectionCoordinator<S> {
    pub(crate) fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    /// Accept `proposal_id` for `request_id` in one snapshot: the proposal
    /// becomes ACCEPTED, the request IN_PROGRESS, and a PENDING escrow for
    /// the proposal price is created.
    ///
    /// Both the request and proposal writes are version-guarded. When two
    /// selections race, the one that commits second fails; it then re-reads
    /// the request and reports `RequestNotOpen`. It never retries.
    pub async fn select(
        &self,
        caller: &Caller,
        request_id: RequestId,
        proposal_id: ProposalId,
    ) -> Result<Selection> {
        let storage = self.ctx.storage.as_ref();
        let request = storage.get_request(request_id).await?;
        require(
            caller.owns_request(&request) || caller.is_admin(),
            "only the buyer may select a proposal",
        )?;

        let selection = match self.try_select(request, proposal_id).await {
            Err(e) if e.is_conflict(&ConflictKind::ConcurrentModification) => {
                let latest = storage.get_request(request_id).await?;
                if latest.status != RequestStatus::Open {
                    warn!(request_id = %request_id, "selection lost the race");
                    return Err(ConflictKind::RequestNotOpen.into());
                }
                return Err(e);
            }
            other => other?,
        };

        info!(
            request_id = %request_id,
            proposal_id = %proposal_id,
            escrow_id = %selection.escrow.id,
            amount = selection.escrow.amount,
            "proposal selected"
        );
        self.ctx.notifier.notify(NotificationEvent::ProposalSelected {
            request_id,
            proposal_id,
            escrow_id: selection.escrow.id,
            buyer_id: selection.request.buyer_id,
            seller_id: selection.proposal.seller_id,
        });
        Ok(selection)
    }

    async fn try_select(
        &self,
        request: DevelopmentRequest,
        proposal_id: ProposalId,
    ) -> Result<Selection> {
        if request.status != RequestStatus::Open {
            return Err(ConflictKind::RequestNotOpen.into());
        }
        let storage = self.ctx.storage.as_ref();
        let proposal = storage.get_proposal(proposal_id).await?;
        if proposal.request_id != request.id {
            return Err(MarketError::validation(format!(
                "proposal {proposal_id} does not belong to request {}",
                request.id
            )));
        }
        if proposal.status != ProposalStatus::Pending {
            return Err(ConflictKind::ProposalNotPending.into());
        }

        let now = self.ctx.clock.now();
        let mut accepted = proposal.clone();
        accepted.status = ProposalStatus::Accepted;
        accepted.selected_at = Some(now);
        accepted.updated_at = now;

        let mut started = transition(&request, RequestStatus::InProgress)?;
        started.selected_proposal_id = Some(proposal_id);
        started.updated_at = now;

        let escrow = Escrow {
            id: EscrowId::new(),
            request_id: request.id,
            proposal_id,
            buyer_id: request.buyer_id,
            seller_id: proposal.seller_id,
            amount: proposal.price,
            status: EscrowStatus::Pending,
            created_at: now,
            funded_at: None,
            closed_at: None,
            version: 0,
        };

        let mut snap = storage.begin_snapshot().await?;
        let staged = async {
            accepted.version = storage.update_proposal(&mut snap, accepted.clone()).await?;
            started.version = storage.update_request(&mut snap, started.clone()).await?;
            storage.insert_escrow(&mut snap, escrow.clone()).await?;
            Ok::<_, MarketError>(())
        }
        .await;
        finish(storage, snap, staged).await?;

        Ok(Selection {
            request: started,
            proposal: accepted,
            escrow,
        })
    }
}
