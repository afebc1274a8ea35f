use bazaar_storage::{constraint, StorageError};

/// State-machine and exclusivity violations. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictKind {
    #[error("request locked")]
    RequestLocked,
    #[error("request not open")]
    RequestNotOpen,
    #[error("duplicate proposal")]
    DuplicateProposal,
    #[error("proposal not pending")]
    ProposalNotPending,
    #[error("already claimed")]
    AlreadyClaimed,
    #[error("escrow is terminal")]
    EscrowTerminal,
    #[error("settlement already exists for period")]
    SettlementExists,
    #[error("settlement period overlaps an existing settlement")]
    SettlementPeriodOverlap,
    #[error("payout already in progress")]
    PayoutInProgress,
    #[error("illegal {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },
    /// A version-guarded write lost to another writer for a reason other
    /// than the ones above.
    #[error("concurrent modification")]
    ConcurrentModification,
}

/// Marketplace policy violations, distinct from malformed input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusinessRuleKind {
    #[error("price out of range: {price} not in [{min}, {max}]")]
    PriceOutOfRange { price: i64, min: i64, max: i64 },
    #[error("seller has no payout account")]
    NoPayoutAccount,
}

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(ConflictKind),

    #[error("business rule violated: {0}")]
    BusinessRule(BusinessRuleKind),

    #[error("external dependency failed: {0}")]
    ExternalDependency(String),

    #[error(transparent)]
    Storage(StorageError),
}

pub type Result<T, E = MarketError> = std::result::Result<T, E>;

impl MarketError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MarketError::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        MarketError::Forbidden(msg.into())
    }

    /// Only failures of external collaborators are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MarketError::ExternalDependency(_))
    }

    pub fn is_conflict(&self, kind: &ConflictKind) -> bool {
        matches!(self, MarketError::Conflict(k) if k == kind)
    }

    /// Short machine-readable category, used in logs and CLI reports.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::Validation(_) => "validation",
            MarketError::NotFound { .. } => "not_found",
            MarketError::Forbidden(_) => "forbidden",
            MarketError::Conflict(_) => "conflict",
            MarketError::BusinessRule(_) => "business_rule",
            MarketError::ExternalDependency(_) => "external_dependency",
            MarketError::Storage(_) => "storage",
        }
    }
}

impl From<ConflictKind> for MarketError {
    fn from(kind: ConflictKind) -> Self {
        MarketError::Conflict(kind)
    }
}

impl From<BusinessRuleKind> for MarketError {
    fn from(kind: BusinessRuleKind) -> Self {
        MarketError::BusinessRule(kind)
    }
}

impl From<StorageError> for MarketError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { entity, id } => MarketError::NotFound { entity, id },
            StorageError::ConcurrentConflict { .. } => {
                MarketError::Conflict(ConflictKind::ConcurrentModification)
            }
            StorageError::UniqueViolation { constraint: name, .. } => match name {
                constraint::ACTIVE_PROPOSAL_PER_SELLER => {
                    MarketError::Conflict(ConflictKind::DuplicateProposal)
                }
                // Both only trip when a second selection races the first.
                constraint::ACCEPTED_PROPOSAL_PER_REQUEST | constraint::ESCROW_PER_REQUEST => {
                    MarketError::Conflict(ConflictKind::RequestNotOpen)
                }
                constraint::SETTLEMENT_PERIOD => {
                    MarketError::Conflict(ConflictKind::SettlementExists)
                }
                constraint::SETTLEMENT_OVERLAP => {
                    MarketError::Conflict(ConflictKind::SettlementPeriodOverlap)
                }
                _ => MarketError::Storage(e),
            },
            other => MarketError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_messages_match_wire_strings() {
        assert_eq!(ConflictKind::RequestLocked.to_string(), "request locked");
        assert_eq!(ConflictKind::RequestNotOpen.to_string(), "request not open");
        assert_eq!(ConflictKind::DuplicateProposal.to_string(), "duplicate proposal");
        assert_eq!(
            ConflictKind::SettlementExists.to_string(),
            "settlement already exists for period"
        );
    }

    #[test]
    fn storage_constraints_map_to_conflicts() {
        let e: MarketError = StorageError::UniqueViolation {
            constraint: constraint::ACTIVE_PROPOSAL_PER_SELLER,
            key: "r/s".into(),
        }
        .into();
        assert!(e.is_conflict(&ConflictKind::DuplicateProposal));

        let e: MarketError = StorageError::conflict("request", "r", 3).into();
        assert!(e.is_conflict(&ConflictKind::ConcurrentModification));

        let e: MarketError = StorageError::Backend("disk".into()).into();
        assert_eq!(e.kind(), "storage");
    }

    #[test]
    fn only_external_failures_retry() {
        assert!(MarketError::ExternalDependency("timeout".into()).is_retryable());
        assert!(!MarketError::Conflict(ConflictKind::PayoutInProgress).is_retryable());
        assert!(!MarketError::validation("bad").is_retryable());
    }
}
