//! Caller identity and capability predicates.
//!
//! Identity is verified upstream; every operation receives a [`Caller`] and
//! only asks yes/no questions of it.

use bazaar_storage::{DevelopmentRequest, Proposal, UserId, Verification};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MarketError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    Seller,
    Verifier,
    Admin,
    /// Payment-capture callbacks and schedulers.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn buyer(id: UserId) -> Self {
        Self::new(id, Role::Buyer)
    }

    pub fn seller(id: UserId) -> Self {
        Self::new(id, Role::Seller)
    }

    pub fn verifier(id: UserId) -> Self {
        Self::new(id, Role::Verifier)
    }

    pub fn admin(id: UserId) -> Self {
        Self::new(id, Role::Admin)
    }

    /// The platform itself, under the nil user id.
    pub fn system() -> Self {
        Self::new(UserId::from_uuid(Uuid::nil()), Role::System)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    pub fn can_post_requests(&self) -> bool {
        matches!(self.role, Role::Buyer | Role::Admin)
    }

    pub fn can_submit_proposals(&self) -> bool {
        matches!(self.role, Role::Seller | Role::Admin)
    }

    pub fn can_verify(&self) -> bool {
        matches!(self.role, Role::Verifier | Role::Admin)
    }

    pub fn owns_request(&self, request: &DevelopmentRequest) -> bool {
        request.buyer_id == self.id
    }

    pub fn owns_proposal(&self, proposal: &Proposal) -> bool {
        proposal.seller_id == self.id
    }

    pub fn is_assigned_verifier(&self, verification: &Verification) -> bool {
        verification.verifier_id == Some(self.id)
    }

    /// System or admin: the roles allowed to drive ledger callbacks.
    pub fn is_platform(&self) -> bool {
        self.is_system() || self.is_admin()
    }
}

/// `Ok(())` when `allowed`, otherwise `Forbidden(reason)`.
pub(crate) fn require(allowed: bool, reason: &str) -> Result<()> {
    if allowed {
        Ok(())
    } else {
        Err(MarketError::forbidden(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_capabilities() {
        let id = UserId::new();
        assert!(Caller::buyer(id).can_post_requests());
        assert!(!Caller::buyer(id).can_submit_proposals());
        assert!(Caller::seller(id).can_submit_proposals());
        assert!(!Caller::seller(id).can_verify());
        assert!(Caller::verifier(id).can_verify());

        let admin = Caller::admin(id);
        assert!(admin.can_post_requests() && admin.can_submit_proposals() && admin.can_verify());
        assert!(admin.is_platform());
        assert!(Caller::system().is_platform());
        assert!(!Caller::system().can_post_requests());
    }

    #[test]
    fn require_maps_to_forbidden() {
        assert!(require(true, "x").is_ok());
        assert!(matches!(require(false, "nope"), Err(MarketError::Forbidden(m)) if m == "nope"));
    }
}
