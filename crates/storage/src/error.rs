/// All errors that can be returned by a marketplace storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: another snapshot modified
    /// the record first. The expected version was not found.
    #[error("concurrent conflict on {entity} {id}: expected version {expected_version}")]
    ConcurrentConflict {
        entity: &'static str,
        id: String,
        expected_version: i64,
    },

    /// No record with the given id.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A record with this primary id already exists.
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// A uniqueness or exclusivity constraint would be broken by the write.
    #[error("constraint {constraint} violated for {key}")]
    UniqueViolation {
        constraint: &'static str,
        key: String,
    },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString, expected_version: i64) -> Self {
        StorageError::ConcurrentConflict {
            entity,
            id: id.to_string(),
            expected_version,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::ConcurrentConflict { .. })
    }
}

/// Constraint names reported in [`StorageError::UniqueViolation`].
pub mod constraint {
    /// One non-withdrawn proposal per (request, seller).
    pub const ACTIVE_PROPOSAL_PER_SELLER: &str = "active_proposal_per_seller";
    /// At most one accepted proposal per request.
    pub const ACCEPTED_PROPOSAL_PER_REQUEST: &str = "accepted_proposal_per_request";
    /// One escrow per request.
    pub const ESCROW_PER_REQUEST: &str = "escrow_per_request";
    /// One settlement per (seller, period start, period end).
    pub const SETTLEMENT_PERIOD: &str = "settlement_period";
    /// No two settlements of one seller may overlap in time.
    pub const SETTLEMENT_OVERLAP: &str = "settlement_overlap";
}
