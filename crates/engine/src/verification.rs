//! Product verification jobs.
//!
//! ```text
//! PENDING --claim--> ASSIGNED --begin--> IN_PROGRESS
//! IN_PROGRESS --submit_review--> COMPLETED --finalize--> APPROVED | REJECTED
//! PENDING | ASSIGNED | IN_PROGRESS --cancel--> CANCELLED
//! ```
//!
//! Level 0 is automated: the record is created already APPROVED with no
//! fee. `submit_review` completes and finalizes in one write, so COMPLETED
//! is only ever observed on records imported from elsewhere.

use bazaar_storage::{
    MarketStorage, ProductId, SellerProfile, UserId, Verification, VerificationFilter,
    VerificationId, VerificationStatus,
};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{require, Caller};
use crate::error::{ConflictKind, MarketError, Result};
use crate::fees::verification_quote;
use crate::notify::NotificationEvent;
use crate::txn::finish;
use crate::Context;

const MAX_COMMENT_CHARS: usize = 5000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Review {
    pub approved: bool,
    pub score: u8,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub badges: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
}

impl Review {
    fn validate(&self) -> Result<()> {
        if self.score > 100 {
            return Err(MarketError::validation(format!(
                "score {} outside 0-100",
                self.score
            )));
        }
        if let Some(ref comments) = self.comments {
            if comments.chars().count() > MAX_COMMENT_CHARS {
                return Err(MarketError::validation(format!(
                    "comments exceed {MAX_COMMENT_CHARS} characters"
                )));
            }
        }
        Ok(())
    }
}

/// Reporting figures for one verifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifierStats {
    pub verifier_id: UserId,
    /// Reviews submitted (COMPLETED, APPROVED or REJECTED).
    pub completed: usize,
    pub approved: usize,
    /// Mean score to two decimals.
    pub average_score: Option<Decimal>,
    /// Mean of `completed_at - assigned_at`.
    pub average_turnaround: Option<time::Duration>,
}

fn step(v: &Verification, next: VerificationStatus) -> Result<()> {
    if v.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(ConflictKind::InvalidTransition {
            entity: "verification",
            from: v.status.as_str(),
            to: next.as_str(),
        }
        .into())
    }
}

pub struct VerificationWorkflowEngine<S> {
    ctx: Context<S>,
}

impl<S: MarketStorage> VerificationWorkflowEngine<S> {
    pub(crate) fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    /// Open a verification for the caller's product. Levels 1–3 wait on the
    /// job board; level 0 is approved on the spot.
    pub async fn request_verification(
        &self,
        caller: &Caller,
        product_id: ProductId,
        level: u8,
    ) -> Result<Verification> {
        require(
            caller.can_submit_proposals(),
            "only sellers may request verification",
        )?;
        let split = verification_quote(&self.ctx.config, level)?;
        let now = self.ctx.clock.now();
        let automated = level == 0;

        let verification = Verification {
            id: VerificationId::new(),
            product_id,
            seller_id: caller.id,
            verifier_id: None,
            level,
            status: if automated {
                VerificationStatus::Approved
            } else {
                VerificationStatus::Pending
            },
            fee: split.fee,
            platform_share: split.platform_share,
            verifier_share: split.verifier_share,
            score: None,
            comments: None,
            badges: Vec::new(),
            improvements: Vec::new(),
            requested_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: automated.then_some(now),
            version: 0,
        };

        let storage = self.ctx.storage.as_ref();
        let mut snap = storage.begin_snapshot().await?;
        let staged = storage
            .insert_verification(&mut snap, verification.clone())
            .await
            .map_err(MarketError::from);
        finish(storage, snap, staged).await?;

        info!(
            verification_id = %verification.id,
            product_id = %product_id,
            level,
            fee = verification.fee,
            status = verification.status.as_str(),
            "verification requested"
        );
        Ok(verification)
    }

    pub async fn get(&self, id: VerificationId) -> Result<Verification> {
        Ok(self.ctx.storage.get_verification(id).await?)
    }

    pub async fn list(&self, filter: &VerificationFilter) -> Result<Vec<Verification>> {
        Ok(self.ctx.storage.list_verifications(filter).await?)
    }

    /// PENDING jobs, optionally of one level, oldest first.
    pub async fn list_open_jobs(&self, level: Option<u8>) -> Result<Vec<Verification>> {
        let filter = VerificationFilter {
            status: Some(VerificationStatus::Pending),
            level,
            ..Default::default()
        };
        self.list(&filter).await
    }

    /// Take an open job. Exactly one of several racing verifiers wins; the
    /// others get `AlreadyClaimed`.
    pub async fn claim(&self, caller: &Caller, id: VerificationId) -> Result<Verification> {
        require(caller.can_verify(), "only verifiers may claim verifications")?;
        let storage = self.ctx.storage.as_ref();
        let current = storage.get_verification(id).await?;
        if current.seller_id == caller.id {
            return Err(MarketError::forbidden(
                "verifiers may not claim their own product",
            ));
        }
        match current.status {
            VerificationStatus::Pending => {}
            VerificationStatus::Assigned
            | VerificationStatus::InProgress
            | VerificationStatus::Completed => return Err(ConflictKind::AlreadyClaimed.into()),
            _ => step(&current, VerificationStatus::Assigned)?,
        }

        let mut assigned = current.clone();
        assigned.status = VerificationStatus::Assigned;
        assigned.verifier_id = Some(caller.id);
        assigned.assigned_at = Some(self.ctx.clock.now());

        match self.write(assigned).await {
            Ok(assigned) => {
                info!(verification_id = %id, verifier_id = %caller.id, "verification claimed");
                self.ctx
                    .notifier
                    .notify(NotificationEvent::VerificationAssigned {
                        verification_id: id,
                        seller_id: assigned.seller_id,
                        verifier_id: caller.id,
                    });
                Ok(assigned)
            }
            Err(e) if e.is_conflict(&ConflictKind::ConcurrentModification) => {
                let latest = storage.get_verification(id).await?;
                if latest.status != VerificationStatus::Pending {
                    Err(ConflictKind::AlreadyClaimed.into())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// ASSIGNED → IN_PROGRESS, by the assigned verifier.
    pub async fn begin(&self, caller: &Caller, id: VerificationId) -> Result<Verification> {
        let current = self.ctx.storage.get_verification(id).await?;
        require(
            caller.is_assigned_verifier(&current),
            "only the assigned verifier may begin",
        )?;
        step(&current, VerificationStatus::InProgress)?;
        let mut started = current;
        started.status = VerificationStatus::InProgress;
        started.started_at = Some(self.ctx.clock.now());
        self.write(started).await
    }

    /// Record the review and finalize to APPROVED or REJECTED. Allowed from
    /// IN_PROGRESS, or from ASSIGNED as an implicit `begin`. Approval raises
    /// the seller's verification level in the same snapshot.
    pub async fn submit_review(
        &self,
        caller: &Caller,
        id: VerificationId,
        review: Review,
    ) -> Result<Verification> {
        review.validate()?;
        let storage = self.ctx.storage.as_ref();
        let current = storage.get_verification(id).await?;
        require(
            caller.is_assigned_verifier(&current),
            "only the assigned verifier may submit a review",
        )?;

        let now = self.ctx.clock.now();
        let mut reviewed = current.clone();
        if reviewed.status == VerificationStatus::Assigned {
            step(&reviewed, VerificationStatus::InProgress)?;
            reviewed.status = VerificationStatus::InProgress;
            reviewed.started_at = Some(now);
        }
        step(&reviewed, VerificationStatus::Completed)?;
        reviewed.status = VerificationStatus::Completed;
        let outcome = if review.approved {
            VerificationStatus::Approved
        } else {
            VerificationStatus::Rejected
        };
        step(&reviewed, outcome)?;
        reviewed.status = outcome;
        reviewed.score = Some(review.score);
        reviewed.comments = review.comments;
        reviewed.badges = review.badges;
        reviewed.improvements = review.improvements;
        reviewed.completed_at = Some(now);

        let profile = if review.approved {
            self.raised_profile(&current, now).await?
        } else {
            None
        };

        let mut snap = storage.begin_snapshot().await?;
        let staged = async {
            reviewed.version = storage
                .update_verification(&mut snap, reviewed.clone())
                .await?;
            if let Some(profile) = profile {
                storage.upsert_seller(&mut snap, profile).await?;
            }
            Ok::<_, MarketError>(())
        }
        .await;
        finish(storage, snap, staged).await?;

        info!(
            verification_id = %id,
            status = reviewed.status.as_str(),
            score = review.score,
            "verification reviewed"
        );
        self.ctx
            .notifier
            .notify(NotificationEvent::VerificationCompleted {
                verification_id: id,
                seller_id: reviewed.seller_id,
                verifier_id: reviewed.verifier_id,
                status: reviewed.status,
                score: reviewed.score,
            });
        Ok(reviewed)
    }

    /// The profile to write when `v` is approved, or `None` when the seller
    /// is already at or above `v.level`.
    async fn raised_profile(
        &self,
        v: &Verification,
        now: time::OffsetDateTime,
    ) -> Result<Option<SellerProfile>> {
        let existing = self.ctx.storage.get_seller(v.seller_id).await?;
        let mut profile = existing.unwrap_or(SellerProfile {
            seller_id: v.seller_id,
            verification_level: 0,
            payout_account_ref: None,
            updated_at: now,
            version: 0,
        });
        if profile.verification_level >= v.level {
            return Ok(None);
        }
        profile.verification_level = v.level;
        profile.updated_at = now;
        Ok(Some(profile))
    }

    /// Withdraw a job that has not been reviewed yet.
    pub async fn cancel(&self, caller: &Caller, id: VerificationId) -> Result<Verification> {
        let current = self.ctx.storage.get_verification(id).await?;
        require(
            current.seller_id == caller.id || caller.is_admin(),
            "only the requesting seller may cancel a verification",
        )?;
        step(&current, VerificationStatus::Cancelled)?;
        let mut cancelled = current;
        cancelled.status = VerificationStatus::Cancelled;
        let cancelled = self.write(cancelled).await?;
        info!(verification_id = %id, "verification cancelled");
        Ok(cancelled)
    }

    pub async fn verifier_stats(&self, verifier_id: UserId) -> Result<VerifierStats> {
        let filter = VerificationFilter {
            verifier_id: Some(verifier_id),
            ..Default::default()
        };
        let reviewed: Vec<Verification> = self
            .list(&filter)
            .await?
            .into_iter()
            .filter(|v| {
                matches!(
                    v.status,
                    VerificationStatus::Completed
                        | VerificationStatus::Approved
                        | VerificationStatus::Rejected
                )
            })
            .collect();

        let approved = reviewed
            .iter()
            .filter(|v| v.status == VerificationStatus::Approved)
            .count();

        let scores: Vec<u8> = reviewed.iter().filter_map(|v| v.score).collect();
        let average_score = if scores.is_empty() {
            None
        } else {
            let total: u64 = scores.iter().map(|s| u64::from(*s)).sum();
            let mean = Decimal::from(total) / Decimal::from(scores.len() as u64);
            Some(mean.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
        };

        let turnarounds: Vec<time::Duration> =
            reviewed.iter().filter_map(Verification::turnaround).collect();
        let average_turnaround = match u32::try_from(turnarounds.len()) {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(turnarounds.iter().copied().sum::<time::Duration>() / n),
        };

        Ok(VerifierStats {
            verifier_id,
            completed: reviewed.len(),
            approved,
            average_score,
            average_turnaround,
        })
    }

    /// Single version-guarded write of one verification.
    async fn write(&self, mut v: Verification) -> Result<Verification> {
        let storage = self.ctx.storage.as_ref();
        let mut snap = storage.begin_snapshot().await?;
        let staged = storage
            .update_verification(&mut snap, v.clone())
            .await
            .map_err(MarketError::from);
        v.version = finish(storage, snap, staged).await?;
        Ok(v)
    }
}
