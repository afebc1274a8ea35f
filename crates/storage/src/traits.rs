use async_trait::async_trait;

use crate::error::StorageError;
use crate::id::{EscrowId, OrderId, ProposalId, RequestId, SettlementId, UserId, VerificationId};
use crate::record::{
    DevelopmentRequest, Escrow, Order, Page, PageRequest, Period, Proposal, RequestFilter,
    SellerProfile, Settlement, SettlementItem, Verification, VerificationFilter,
};

/// Transaction lifecycle shared by every repository.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    or `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back.
///
/// Reads that do not take a snapshot observe committed state only.
///
/// ## OCC Conflict Detection
///
/// Every `update_*` method is conditional: the record passed in carries the
/// version the caller read, and the backend applies it with
/// `UPDATE ... WHERE id = $1 AND version = $2`. If zero rows would be
/// affected the method (or the commit) returns
/// `Err(StorageError::ConcurrentConflict { .. })`. On success the stored
/// version is `expected + 1`, which is returned.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` so one store can be shared
/// by many concurrent request handlers.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable. Fails with
    /// `ConcurrentConflict` or `UniqueViolation` if any buffered write no
    /// longer applies, in which case nothing is written.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;
}

#[async_trait]
pub trait RequestRepository: SnapshotStore {
    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn insert_request(
        &self,
        snapshot: &mut Self::Snapshot,
        request: DevelopmentRequest,
    ) -> Result<(), StorageError>;

    async fn get_request(&self, id: RequestId) -> Result<DevelopmentRequest, StorageError>;

    /// Read a request and pin its version for the rest of the snapshot.
    ///
    /// Uses `SELECT ... FOR UPDATE` semantics: the commit fails with
    /// `ConcurrentConflict` if another snapshot changed the row meanwhile.
    async fn get_request_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: RequestId,
    ) -> Result<DevelopmentRequest, StorageError>;

    async fn update_request(
        &self,
        snapshot: &mut Self::Snapshot,
        request: DevelopmentRequest,
    ) -> Result<i64, StorageError>;

    /// Newest first.
    async fn list_requests(
        &self,
        filter: &RequestFilter,
        page: PageRequest,
    ) -> Result<Page<DevelopmentRequest>, StorageError>;
}

#[async_trait]
pub trait ProposalRepository: SnapshotStore {
    /// Enforces one non-withdrawn proposal per (request, seller) and at most
    /// one accepted proposal per request.
    async fn insert_proposal(
        &self,
        snapshot: &mut Self::Snapshot,
        proposal: Proposal,
    ) -> Result<(), StorageError>;

    async fn get_proposal(&self, id: ProposalId) -> Result<Proposal, StorageError>;

    async fn update_proposal(
        &self,
        snapshot: &mut Self::Snapshot,
        proposal: Proposal,
    ) -> Result<i64, StorageError>;

    /// Oldest first.
    async fn list_proposals(&self, request_id: RequestId) -> Result<Vec<Proposal>, StorageError>;

    async fn list_proposals_by_seller(
        &self,
        seller_id: UserId,
    ) -> Result<Vec<Proposal>, StorageError>;
}

#[async_trait]
pub trait EscrowRepository: SnapshotStore {
    /// Enforces one escrow per request.
    async fn insert_escrow(
        &self,
        snapshot: &mut Self::Snapshot,
        escrow: Escrow,
    ) -> Result<(), StorageError>;

    async fn get_escrow(&self, id: EscrowId) -> Result<Escrow, StorageError>;

    async fn find_escrow_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<Escrow>, StorageError>;

    async fn update_escrow(
        &self,
        snapshot: &mut Self::Snapshot,
        escrow: Escrow,
    ) -> Result<i64, StorageError>;
}

#[async_trait]
pub trait VerificationRepository: SnapshotStore {
    async fn insert_verification(
        &self,
        snapshot: &mut Self::Snapshot,
        verification: Verification,
    ) -> Result<(), StorageError>;

    async fn get_verification(&self, id: VerificationId) -> Result<Verification, StorageError>;

    async fn update_verification(
        &self,
        snapshot: &mut Self::Snapshot,
        verification: Verification,
    ) -> Result<i64, StorageError>;

    /// Oldest request first.
    async fn list_verifications(
        &self,
        filter: &VerificationFilter,
    ) -> Result<Vec<Verification>, StorageError>;

    /// Verifications performed by `verifier_id` in status COMPLETED or
    /// APPROVED whose `completed_at` falls in `period`.
    async fn list_completed_verifications(
        &self,
        verifier_id: UserId,
        period: Period,
    ) -> Result<Vec<Verification>, StorageError>;

    /// Distinct verifiers with at least one COMPLETED or APPROVED
    /// verification completed in `period`.
    async fn verifiers_with_completed_work(
        &self,
        period: Period,
    ) -> Result<Vec<UserId>, StorageError>;
}

#[async_trait]
pub trait OrderRepository: SnapshotStore {
    async fn insert_order(
        &self,
        snapshot: &mut Self::Snapshot,
        order: Order,
    ) -> Result<(), StorageError>;

    async fn get_order(&self, id: OrderId) -> Result<Order, StorageError>;

    async fn update_order(
        &self,
        snapshot: &mut Self::Snapshot,
        order: Order,
    ) -> Result<i64, StorageError>;

    async fn list_orders_by_escrow(&self, escrow_id: EscrowId) -> Result<Vec<Order>, StorageError>;

    /// PAID orders of `seller_id` whose `paid_at` falls in `period`.
    async fn list_paid_orders(
        &self,
        seller_id: UserId,
        period: Period,
    ) -> Result<Vec<Order>, StorageError>;

    /// Distinct sellers with at least one PAID order in `period`.
    async fn sellers_with_paid_orders(&self, period: Period) -> Result<Vec<UserId>, StorageError>;
}

#[async_trait]
pub trait SellerRepository: SnapshotStore {
    /// Insert a new profile, or overwrite one whose version matches.
    async fn upsert_seller(
        &self,
        snapshot: &mut Self::Snapshot,
        profile: SellerProfile,
    ) -> Result<i64, StorageError>;

    /// Returns `Ok(None)` for sellers that never had a profile.
    async fn get_seller(&self, seller_id: UserId) -> Result<Option<SellerProfile>, StorageError>;
}

#[async_trait]
pub trait SettlementRepository: SnapshotStore {
    /// Insert a settlement with its breakdown rows. Enforces one settlement
    /// per (seller, period) and no overlapping periods per seller.
    async fn insert_settlement(
        &self,
        snapshot: &mut Self::Snapshot,
        settlement: Settlement,
        items: Vec<SettlementItem>,
    ) -> Result<(), StorageError>;

    async fn get_settlement(&self, id: SettlementId) -> Result<Settlement, StorageError>;

    /// Exact period match.
    async fn find_settlement(
        &self,
        seller_id: UserId,
        period: Period,
    ) -> Result<Option<Settlement>, StorageError>;

    /// Oldest period first.
    async fn list_settlements(&self, seller_id: UserId) -> Result<Vec<Settlement>, StorageError>;

    async fn list_settlement_items(
        &self,
        settlement_id: SettlementId,
    ) -> Result<Vec<SettlementItem>, StorageError>;

    async fn update_settlement(
        &self,
        snapshot: &mut Self::Snapshot,
        settlement: Settlement,
    ) -> Result<i64, StorageError>;
}

/// Everything the marketplace engine needs from a backend.
pub trait MarketStorage:
    RequestRepository
    + ProposalRepository
    + EscrowRepository
    + VerificationRepository
    + OrderRepository
    + SellerRepository
    + SettlementRepository
{
}

impl<T> MarketStorage for T where
    T: RequestRepository
        + ProposalRepository
        + EscrowRepository
        + VerificationRepository
        + OrderRepository
        + SellerRepository
        + SettlementRepository
{
}
