use bazaar_storage::{
    DevelopmentRequest, MarketStorage, Page, PageRequest, RequestFilter, RequestId, RequestStatus,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{require, Caller};
use crate::error::{ConflictKind, MarketError, Result};
use crate::txn::finish;
use crate::Context;

pub type Paged<T> = Page<T>;

const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    pub title: String,
    pub description: String,
    pub category: String,
    pub budget_min: i64,
    pub budget_max: i64,
    pub timeline: String,
    #[serde(default)]
    pub requirements: serde_json::Value,
}

/// Buyer-editable fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub budget_min: Option<i64>,
    pub budget_max: Option<i64>,
    pub timeline: Option<String>,
    pub requirements: Option<serde_json::Value>,
}

impl RequestPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.budget_min.is_none()
            && self.budget_max.is_none()
            && self.timeline.is_none()
            && self.requirements.is_none()
    }

    fn apply(self, request: &mut DevelopmentRequest) {
        if let Some(v) = self.title {
            request.title = v;
        }
        if let Some(v) = self.description {
            request.description = v;
        }
        if let Some(v) = self.category {
            request.category = v;
        }
        if let Some(v) = self.budget_min {
            request.budget_min = v;
        }
        if let Some(v) = self.budget_max {
            request.budget_max = v;
        }
        if let Some(v) = self.timeline {
            request.timeline = v;
        }
        if let Some(v) = self.requirements {
            request.requirements = v;
        }
    }
}

fn validate_fields(
    title: &str,
    description: &str,
    category: &str,
    budget_min: i64,
    budget_max: i64,
) -> Result<()> {
    if title.trim().is_empty() {
        return Err(MarketError::validation("title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(MarketError::validation(format!(
            "title exceeds {MAX_TITLE_CHARS} characters"
        )));
    }
    if description.trim().is_empty() {
        return Err(MarketError::validation("description must not be empty"));
    }
    if category.trim().is_empty() {
        return Err(MarketError::validation("category must not be empty"));
    }
    if budget_min <= 0 {
        return Err(MarketError::validation("budget_min must be positive"));
    }
    if budget_min > budget_max {
        return Err(MarketError::validation(format!(
            "budget_min {budget_min} exceeds budget_max {budget_max}"
        )));
    }
    Ok(())
}

pub(crate) fn transition(
    request: &DevelopmentRequest,
    next: RequestStatus,
) -> Result<DevelopmentRequest> {
    if !request.status.can_transition_to(next) {
        return Err(ConflictKind::InvalidTransition {
            entity: "request",
            from: request.status.as_str(),
            to: next.as_str(),
        }
        .into());
    }
    let mut moved = request.clone();
    moved.status = next;
    Ok(moved)
}

pub struct RequestStore<S> {
    ctx: Context<S>,
}

impl<S: MarketStorage> RequestStore<S> {
    pub(crate) fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    pub async fn create(&self, caller: &Caller, input: NewRequest) -> Result<DevelopmentRequest> {
        require(caller.can_post_requests(), "only buyers may post requests")?;
        validate_fields(
            &input.title,
            &input.description,
            &input.category,
            input.budget_min,
            input.budget_max,
        )?;

        let now = self.ctx.clock.now();
        let request = DevelopmentRequest {
            id: RequestId::new(),
            buyer_id: caller.id,
            title: input.title,
            description: input.description,
            category: input.category,
            budget_min: input.budget_min,
            budget_max: input.budget_max,
            timeline: input.timeline,
            requirements: input.requirements,
            status: RequestStatus::Open,
            selected_proposal_id: None,
            proposal_count: 0,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let storage = self.ctx.storage.as_ref();
        let mut snap = storage.begin_snapshot().await?;
        let staged = storage
            .insert_request(&mut snap, request.clone())
            .await
            .map_err(MarketError::from);
        finish(storage, snap, staged).await?;

        info!(request_id = %request.id, buyer_id = %request.buyer_id, "request created");
        Ok(request)
    }

    pub async fn get(&self, id: RequestId) -> Result<DevelopmentRequest> {
        Ok(self.ctx.storage.get_request(id).await?)
    }

    /// Newest first. `page.limit` is clamped to `max_page_size`.
    pub async fn list(
        &self,
        filter: &RequestFilter,
        page: PageRequest,
    ) -> Result<Paged<DevelopmentRequest>> {
        let page = PageRequest {
            offset: page.offset,
            limit: page.limit.clamp(1, self.ctx.config.max_page_size),
        };
        Ok(self.ctx.storage.list_requests(filter, page).await?)
    }

    /// Edit buyer-owned fields. Locked once any proposal has been submitted.
    pub async fn update(
        &self,
        id: RequestId,
        caller: &Caller,
        patch: RequestPatch,
    ) -> Result<DevelopmentRequest> {
        let storage = self.ctx.storage.as_ref();
        let current = storage.get_request(id).await?;
        require(
            caller.owns_request(&current) || caller.is_admin(),
            "only the buyer may edit a request",
        )?;
        if current.status != RequestStatus::Open {
            return Err(ConflictKind::RequestNotOpen.into());
        }
        if patch.is_empty() {
            return Ok(current);
        }
        if current.proposal_count > 0 {
            return Err(ConflictKind::RequestLocked.into());
        }

        let mut updated = current.clone();
        patch.apply(&mut updated);
        validate_fields(
            &updated.title,
            &updated.description,
            &updated.category,
            updated.budget_min,
            updated.budget_max,
        )?;
        updated.updated_at = self.ctx.clock.now();

        let mut snap = storage.begin_snapshot().await?;
        let staged = storage
            .update_request(&mut snap, updated.clone())
            .await
            .map_err(MarketError::from);
        match finish(storage, snap, staged).await {
            Ok(version) => {
                updated.version = version;
                Ok(updated)
            }
            // A proposal landed first: the version bump came from its counter.
            Err(e) if e.is_conflict(&ConflictKind::ConcurrentModification) => {
                let latest = storage.get_request(id).await?;
                if latest.status != RequestStatus::Open {
                    Err(ConflictKind::RequestNotOpen.into())
                } else if latest.proposal_count > 0 {
                    Err(ConflictKind::RequestLocked.into())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// OPEN or IN_PROGRESS → CANCELLED. Refunding a funded escrow is the
    /// payment collaborator's job.
    pub async fn cancel(&self, id: RequestId, caller: &Caller) -> Result<DevelopmentRequest> {
        let storage = self.ctx.storage.as_ref();
        let current = storage.get_request(id).await?;
        require(
            caller.owns_request(&current) || caller.is_admin(),
            "only the buyer may cancel a request",
        )?;
        let cancelled = self.transition_status_of(&current, RequestStatus::Cancelled).await?;
        info!(request_id = %id, "request cancelled");
        Ok(cancelled)
    }

    /// Platform-driven status change (order completion, moderation).
    /// IN_PROGRESS is reachable only through selection.
    pub async fn transition_status(
        &self,
        caller: &Caller,
        id: RequestId,
        next: RequestStatus,
    ) -> Result<DevelopmentRequest> {
        require(caller.is_platform(), "only the platform may drive request status")?;
        if next == RequestStatus::InProgress {
            return Err(MarketError::validation(
                "requests enter IN_PROGRESS only by selecting a proposal",
            ));
        }
        let current = self.ctx.storage.get_request(id).await?;
        self.transition_status_of(&current, next).await
    }

    async fn transition_status_of(
        &self,
        current: &DevelopmentRequest,
        next: RequestStatus,
    ) -> Result<DevelopmentRequest> {
        let mut moved = transition(current, next)?;
        if !next.has_selection() {
            moved.selected_proposal_id = None;
        }
        moved.updated_at = self.ctx.clock.now();

        let storage = self.ctx.storage.as_ref();
        let mut snap = storage.begin_snapshot().await?;
        let staged = storage
            .update_request(&mut snap, moved.clone())
            .await
            .map_err(MarketError::from);
        moved.version = finish(storage, snap, staged).await?;
        Ok(moved)
    }
}
