use bazaar_storage::{
    DevelopmentRequest, MarketStorage, Proposal, ProposalId, ProposalStatus, RequestId,
    RequestStatus, UserId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::{require, Caller};
use crate::error::{BusinessRuleKind, ConflictKind, MarketError, Result};
use crate::notify::NotificationEvent;
use crate::txn::finish;
use crate::Context;

/// Proposal creation re-reads and re-validates on every attempt, so losing
/// the request-counter race to another seller is safe to retry. A lost
/// attempt always means some other write to the request committed.
const CREATE_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProposal {
    pub request_id: RequestId,
    pub price: i64,
    pub timeline: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalPatch {
    pub price: Option<i64>,
    pub timeline: Option<String>,
    pub description: Option<String>,
}

fn check_price(request: &DevelopmentRequest, price: i64) -> Result<()> {
    if price <= 0 {
        return Err(MarketError::validation("price must be positive"));
    }
    if !request.budget_contains(price) {
        return Err(BusinessRuleKind::PriceOutOfRange {
            price,
            min: request.budget_min,
            max: request.budget_max,
        }
        .into());
    }
    Ok(())
}

fn check_description(description: &str) -> Result<()> {
    if description.trim().is_empty() {
        return Err(MarketError::validation("description must not be empty"));
    }
    Ok(())
}

pub struct ProposalStore<S> {
    ctx: Context<S>,
}

impl<S: MarketStorage> ProposalStore<S> {
    pub(crate) fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    pub async fn create(&self, caller: &Caller, input: NewProposal) -> Result<Proposal> {
        require(caller.can_submit_proposals(), "only sellers may submit proposals")?;
        check_description(&input.description)?;

        let mut attempt = 0;
        let (request, proposal) = loop {
            attempt += 1;
            match self.try_create(caller.id, &input).await {
                Err(e)
                    if attempt < CREATE_ATTEMPTS
                        && e.is_conflict(&ConflictKind::ConcurrentModification) =>
                {
                    debug!(request_id = %input.request_id, attempt, "proposal create lost counter race; retrying");
                    tokio::task::yield_now().await;
                }
                other => break other?,
            }
        };

        info!(
            proposal_id = %proposal.id,
            request_id = %request.id,
            seller_id = %proposal.seller_id,
            price = proposal.price,
            "proposal submitted"
        );
        self.ctx.notifier.notify(NotificationEvent::ProposalSubmitted {
            request_id: request.id,
            proposal_id: proposal.id,
            buyer_id: request.buyer_id,
            seller_id: proposal.seller_id,
            price: proposal.price,
        });
        Ok(proposal)
    }

    async fn try_create(
        &self,
        seller_id: UserId,
        input: &NewProposal,
    ) -> Result<(DevelopmentRequest, Proposal)> {
        let storage = self.ctx.storage.as_ref();
        let request = storage.get_request(input.request_id).await?;

        if request.buyer_id == seller_id {
            return Err(MarketError::forbidden(
                "sellers may not propose on their own request",
            ));
        }
        if request.status != RequestStatus::Open {
            return Err(ConflictKind::RequestNotOpen.into());
        }
        let existing = storage.list_proposals(request.id).await?;
        if existing
            .iter()
            .any(|p| p.seller_id == seller_id && p.status.is_active())
        {
            return Err(ConflictKind::DuplicateProposal.into());
        }
        check_price(&request, input.price)?;

        let now = self.ctx.clock.now();
        let proposal = Proposal {
            id: ProposalId::new(),
            request_id: request.id,
            seller_id,
            price: input.price,
            timeline: input.timeline.clone(),
            description: input.description.clone(),
            status: ProposalStatus::Pending,
            selected_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let mut counted = request.clone();
        counted.proposal_count += 1;

        let mut snap = storage.begin_snapshot().await?;
        let staged = async {
            storage.insert_proposal(&mut snap, proposal.clone()).await?;
            storage.update_request(&mut snap, counted.clone()).await?;
            Ok::<_, MarketError>(())
        }
        .await;
        match finish(storage, snap, staged).await {
            Ok(()) => Ok((request, proposal)),
            Err(e) if e.is_conflict(&ConflictKind::ConcurrentModification) => {
                // Selection or cancellation wins over a late proposal.
                let latest = storage.get_request(request.id).await?;
                if latest.status != RequestStatus::Open {
                    Err(ConflictKind::RequestNotOpen.into())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: ProposalId) -> Result<Proposal> {
        Ok(self.ctx.storage.get_proposal(id).await?)
    }

    /// Oldest first.
    pub async fn list(&self, request_id: RequestId) -> Result<Vec<Proposal>> {
        Ok(self.ctx.storage.list_proposals(request_id).await?)
    }

    pub async fn list_by_seller(&self, seller_id: UserId) -> Result<Vec<Proposal>> {
        Ok(self.ctx.storage.list_proposals_by_seller(seller_id).await?)
    }

    pub async fn update(
        &self,
        id: ProposalId,
        caller: &Caller,
        patch: ProposalPatch,
    ) -> Result<Proposal> {
        self.change_pending(id, |proposal, request| {
            require(
                caller.owns_proposal(proposal) || caller.is_admin(),
                "only the seller may edit a proposal",
            )?;
            if let Some(price) = patch.price {
                check_price(request, price)?;
                proposal.price = price;
            }
            if let Some(ref description) = patch.description {
                check_description(description)?;
                proposal.description = description.clone();
            }
            if let Some(ref timeline) = patch.timeline {
                proposal.timeline = timeline.clone();
            }
            Ok(())
        })
        .await
    }

    pub async fn withdraw(&self, id: ProposalId, caller: &Caller) -> Result<Proposal> {
        let withdrawn = self
            .change_pending(id, |proposal, _| {
                require(
                    caller.owns_proposal(proposal) || caller.is_admin(),
                    "only the seller may withdraw a proposal",
                )?;
                proposal.status = ProposalStatus::Withdrawn;
                Ok(())
            })
            .await?;
        info!(proposal_id = %id, "proposal withdrawn");
        Ok(withdrawn)
    }

    /// The buyer declines a pending proposal while the request is open.
    pub async fn reject(&self, id: ProposalId, caller: &Caller) -> Result<Proposal> {
        let rejected = self
            .change_pending(id, |proposal, request| {
                require(
                    caller.owns_request(request) || caller.is_admin(),
                    "only the buyer may reject a proposal",
                )?;
                proposal.status = ProposalStatus::Rejected;
                Ok(())
            })
            .await?;
        info!(proposal_id = %id, "proposal rejected");
        Ok(rejected)
    }

    /// Apply `change` to a PENDING proposal of an OPEN request. The request
    /// version is pinned for the snapshot, so a selection committing in
    /// between turns this write into `RequestNotOpen`.
    async fn change_pending<F>(&self, id: ProposalId, change: F) -> Result<Proposal>
    where
        F: FnOnce(&mut Proposal, &DevelopmentRequest) -> Result<()>,
    {
        let storage = self.ctx.storage.as_ref();
        let current = storage.get_proposal(id).await?;
        let mut snap = storage.begin_snapshot().await?;

        let staged = async {
            let request = storage
                .get_request_for_update(&mut snap, current.request_id)
                .await?;
            if current.status != ProposalStatus::Pending {
                return Err(MarketError::Conflict(ConflictKind::ProposalNotPending));
            }
            if request.status != RequestStatus::Open {
                return Err(MarketError::Conflict(ConflictKind::RequestNotOpen));
            }
            let mut changed = current.clone();
            change(&mut changed, &request)?;
            changed.updated_at = self.ctx.clock.now();
            changed.version = storage.update_proposal(&mut snap, changed.clone()).await?;
            Ok::<_, MarketError>(changed)
        }
        .await;

        match finish(storage, snap, staged).await {
            Err(e) if e.is_conflict(&ConflictKind::ConcurrentModification) => {
                let request = storage.get_request(current.request_id).await?;
                let latest = storage.get_proposal(id).await?;
                if request.status != RequestStatus::Open {
                    Err(ConflictKind::RequestNotOpen.into())
                } else if latest.status != ProposalStatus::Pending {
                    Err(ConflictKind::ProposalNotPending.into())
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }
}
