pub mod conformance;
mod error;
mod id;
mod memory;
mod record;
mod traits;

pub use error::{constraint, StorageError};
pub use id::{
    EscrowId, Id, OrderId, ProductId, ProposalId, RequestId, SettlementId, UserId, VerificationId,
};
pub use memory::{LedgerFixture, MemorySnapshot, MemoryStorage};
pub use record::{
    DevelopmentRequest, Escrow, EscrowStatus, Order, OrderStatus, Page, PageRequest, Period,
    Proposal, ProposalStatus, RequestFilter, RequestStatus, SellerProfile, Settlement,
    SettlementItem, SettlementStatus, Verification, VerificationFilter, VerificationStatus,
};
pub use traits::{
    EscrowRepository, MarketStorage, OrderRepository, ProposalRepository, RequestRepository,
    SellerRepository, SettlementRepository, SnapshotStore, VerificationRepository,
};
