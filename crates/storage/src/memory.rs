//! In-memory storage backend.
//!
//! Committed rows live in one set of tables behind a mutex. A
//! [`MemorySnapshot`] buffers writes and read guards; at commit the tables
//! are cloned, every buffered operation is re-validated (versions,
//! uniqueness constraints) and applied to the clone, and the clone replaces
//! the tables only if all of them succeed. Writes are also checked against
//! committed state when they are issued, so a stale version fails fast the
//! way a zero-row conditional UPDATE would.
//!
//! Reads inside a snapshot see committed state, not the snapshot's own
//! buffered writes.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{constraint, StorageError};
use crate::id::{EscrowId, OrderId, ProposalId, RequestId, SettlementId, UserId, VerificationId};
use crate::record::{
    DevelopmentRequest, Escrow, Order, OrderStatus, Page, PageRequest, Period, Proposal,
    ProposalStatus, RequestFilter, SellerProfile, Settlement, SettlementItem, Verification,
    VerificationFilter,
};
use crate::traits::{
    EscrowRepository, OrderRepository, ProposalRepository, RequestRepository, SellerRepository,
    SettlementRepository, SnapshotStore, VerificationRepository,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    requests: HashMap<RequestId, DevelopmentRequest>,
    proposals: HashMap<ProposalId, Proposal>,
    escrows: HashMap<EscrowId, Escrow>,
    verifications: HashMap<VerificationId, Verification>,
    orders: HashMap<OrderId, Order>,
    sellers: HashMap<UserId, SellerProfile>,
    settlements: HashMap<SettlementId, Settlement>,
    settlement_items: HashMap<SettlementId, Vec<SettlementItem>>,
}

/// A buffered write or read guard, replayed against the tables at commit.
type Op = Box<dyn FnOnce(&mut Tables) -> Result<(), StorageError> + Send>;

/// An open transaction against [`MemoryStorage`].
#[derive(Default)]
pub struct MemorySnapshot {
    ops: Vec<Op>,
}

/// Shared, cloneable in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

/// Rows to preload into a [`MemoryStorage`], e.g. from a JSON ledger file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerFixture {
    #[serde(default)]
    pub sellers: Vec<SellerProfile>,
    #[serde(default)]
    pub requests: Vec<DevelopmentRequest>,
    #[serde(default)]
    pub proposals: Vec<Proposal>,
    #[serde(default)]
    pub escrows: Vec<Escrow>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub verifications: Vec<Verification>,
    #[serde(default)]
    pub settlements: Vec<Settlement>,
    #[serde(default)]
    pub settlement_items: Vec<SettlementItem>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding every row of `fixture`, checked against the
    /// same constraints as normal inserts.
    pub async fn from_fixture(fixture: LedgerFixture) -> Result<Self, StorageError> {
        let storage = Self::new();
        let mut snap = storage.begin_snapshot().await?;
        for row in fixture.sellers {
            snap.ops.push(insert_op(row));
        }
        for row in fixture.requests {
            snap.ops.push(insert_op(row));
        }
        for row in fixture.proposals {
            snap.ops.push(insert_op(row));
        }
        for row in fixture.escrows {
            snap.ops.push(insert_op(row));
        }
        for row in fixture.orders {
            snap.ops.push(insert_op(row));
        }
        for row in fixture.verifications {
            snap.ops.push(insert_op(row));
        }
        for row in fixture.settlements {
            snap.ops.push(insert_op(row));
        }
        for item in fixture.settlement_items {
            snap.ops.push(Box::new(move |t| {
                if !t.settlements.contains_key(&item.settlement_id) {
                    return Err(StorageError::not_found("settlement", item.settlement_id));
                }
                t.settlement_items.entry(item.settlement_id).or_default().push(item);
                Ok(())
            }));
        }
        storage.commit_snapshot(snap).await?;
        Ok(storage)
    }

    /// Every committed row, in a stable order, ready to be written back to
    /// a ledger file.
    pub fn to_fixture(&self) -> Result<LedgerFixture, StorageError> {
        self.read(|t| {
            let mut fixture = LedgerFixture {
                sellers: t.sellers.values().cloned().collect(),
                requests: t.requests.values().cloned().collect(),
                proposals: t.proposals.values().cloned().collect(),
                escrows: t.escrows.values().cloned().collect(),
                orders: t.orders.values().cloned().collect(),
                verifications: t.verifications.values().cloned().collect(),
                settlements: t.settlements.values().cloned().collect(),
                settlement_items: Vec::new(),
            };
            fixture.sellers.sort_by_key(|r| r.seller_id);
            fixture.requests.sort_by_key(|r| r.id);
            fixture.proposals.sort_by_key(|r| r.id);
            fixture.escrows.sort_by_key(|r| r.id);
            fixture.orders.sort_by_key(|r| r.id);
            fixture.verifications.sort_by_key(|r| r.id);
            fixture.settlements.sort_by_key(|r| r.id);
            fixture.settlement_items = fixture
                .settlements
                .iter()
                .flat_map(|s| t.settlement_items.get(&s.id).cloned().unwrap_or_default())
                .collect();
            fixture
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory tables poisoned".to_string()))
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StorageError> {
        let tables = self.lock()?;
        Ok(f(&tables))
    }

    fn stage_insert<R: Row>(&self, snap: &mut MemorySnapshot, row: R) -> Result<(), StorageError> {
        {
            let tables = self.lock()?;
            check_insert(&tables, &row)?;
        }
        snap.ops.push(insert_op(row));
        Ok(())
    }

    fn stage_update<R: Row>(&self, snap: &mut MemorySnapshot, row: R) -> Result<i64, StorageError> {
        {
            let tables = self.lock()?;
            check_update(&tables, &row)?;
        }
        let next = row.version() + 1;
        snap.ops.push(Box::new(move |t| update_row(t, row)));
        Ok(next)
    }

    fn stage_guard<R: Row>(
        &self,
        snap: &mut MemorySnapshot,
        key: R::Key,
    ) -> Result<R, StorageError> {
        let row = self.read(|t| R::table(t).get(&key).cloned())?;
        let row = row.ok_or_else(|| StorageError::not_found(R::ENTITY, key))?;
        let pinned = row.version();
        snap.ops.push(Box::new(move |t| {
            match R::table(t).get(&key) {
                Some(current) if current.version() == pinned => Ok(()),
                Some(_) => Err(StorageError::conflict(R::ENTITY, key, pinned)),
                None => Err(StorageError::not_found(R::ENTITY, key)),
            }
        }));
        Ok(row)
    }

    fn fetch<R: Row>(&self, key: R::Key) -> Result<R, StorageError> {
        self.read(|t| R::table(t).get(&key).cloned())?
            .ok_or_else(|| StorageError::not_found(R::ENTITY, key))
    }
}

// ── Row abstraction ──────────────────────────────────────────────────────────

trait Row: Clone + Send + 'static {
    type Key: Copy + Eq + Hash + Display + Send + 'static;
    const ENTITY: &'static str;

    fn key(&self) -> Self::Key;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
    fn table(t: &Tables) -> &HashMap<Self::Key, Self>;
    fn table_mut(t: &mut Tables) -> &mut HashMap<Self::Key, Self>;

    /// Cross-row constraints the row must satisfy against `t`.
    fn check_constraints(&self, _t: &Tables) -> Result<(), StorageError> {
        Ok(())
    }
}

macro_rules! row {
    ($ty:ty, $key:ty, $entity:literal, $field:ident, $id:ident) => {
        impl Row for $ty {
            type Key = $key;
            const ENTITY: &'static str = $entity;

            fn key(&self) -> $key {
                self.$id
            }
            fn version(&self) -> i64 {
                self.version
            }
            fn set_version(&mut self, version: i64) {
                self.version = version;
            }
            fn table(t: &Tables) -> &HashMap<$key, Self> {
                &t.$field
            }
            fn table_mut(t: &mut Tables) -> &mut HashMap<$key, Self> {
                &mut t.$field
            }
        }
    };
    ($ty:ty, $key:ty, $entity:literal, $field:ident, $id:ident, $check:path) => {
        impl Row for $ty {
            type Key = $key;
            const ENTITY: &'static str = $entity;

            fn key(&self) -> $key {
                self.$id
            }
            fn version(&self) -> i64 {
                self.version
            }
            fn set_version(&mut self, version: i64) {
                self.version = version;
            }
            fn table(t: &Tables) -> &HashMap<$key, Self> {
                &t.$field
            }
            fn table_mut(t: &mut Tables) -> &mut HashMap<$key, Self> {
                &mut t.$field
            }
            fn check_constraints(&self, t: &Tables) -> Result<(), StorageError> {
                $check(self, t)
            }
        }
    };
}

row!(DevelopmentRequest, RequestId, "request", requests, id);
row!(Proposal, ProposalId, "proposal", proposals, id, proposal_constraints);
row!(Escrow, EscrowId, "escrow", escrows, id, escrow_constraints);
row!(Verification, VerificationId, "verification", verifications, id);
row!(Order, OrderId, "order", orders, id);
row!(SellerProfile, UserId, "seller", sellers, seller_id);
row!(Settlement, SettlementId, "settlement", settlements, id, settlement_constraints);

fn proposal_constraints(p: &Proposal, t: &Tables) -> Result<(), StorageError> {
    let others = t.proposals.values().filter(|o| o.id != p.id && o.request_id == p.request_id);
    for other in others {
        if p.status.is_active() && other.status.is_active() && other.seller_id == p.seller_id {
            return Err(StorageError::UniqueViolation {
                constraint: constraint::ACTIVE_PROPOSAL_PER_SELLER,
                key: format!("{}/{}", p.request_id, p.seller_id),
            });
        }
        if p.status == ProposalStatus::Accepted && other.status == ProposalStatus::Accepted {
            return Err(StorageError::UniqueViolation {
                constraint: constraint::ACCEPTED_PROPOSAL_PER_REQUEST,
                key: p.request_id.to_string(),
            });
        }
    }
    Ok(())
}

fn escrow_constraints(e: &Escrow, t: &Tables) -> Result<(), StorageError> {
    if t.escrows.values().any(|o| o.id != e.id && o.request_id == e.request_id) {
        return Err(StorageError::UniqueViolation {
            constraint: constraint::ESCROW_PER_REQUEST,
            key: e.request_id.to_string(),
        });
    }
    Ok(())
}

fn settlement_constraints(s: &Settlement, t: &Tables) -> Result<(), StorageError> {
    let same_seller = t
        .settlements
        .values()
        .filter(|o| o.id != s.id && o.seller_id == s.seller_id);
    for other in same_seller {
        if other.period == s.period {
            return Err(StorageError::UniqueViolation {
                constraint: constraint::SETTLEMENT_PERIOD,
                key: format!("{}/{}..{}", s.seller_id, s.period.start, s.period.end),
            });
        }
        if other.period.overlaps(&s.period) {
            return Err(StorageError::UniqueViolation {
                constraint: constraint::SETTLEMENT_OVERLAP,
                key: format!("{}/{}..{}", s.seller_id, s.period.start, s.period.end),
            });
        }
    }
    Ok(())
}

fn check_insert<R: Row>(t: &Tables, row: &R) -> Result<(), StorageError> {
    if R::table(t).contains_key(&row.key()) {
        return Err(StorageError::AlreadyExists {
            entity: R::ENTITY,
            id: row.key().to_string(),
        });
    }
    row.check_constraints(t)
}

fn check_update<R: Row>(t: &Tables, row: &R) -> Result<(), StorageError> {
    match R::table(t).get(&row.key()) {
        None => Err(StorageError::not_found(R::ENTITY, row.key())),
        Some(current) if current.version() != row.version() => {
            Err(StorageError::conflict(R::ENTITY, row.key(), row.version()))
        }
        Some(_) => row.check_constraints(t),
    }
}

fn insert_op<R: Row>(row: R) -> Op {
    Box::new(move |t| {
        check_insert(t, &row)?;
        R::table_mut(t).insert(row.key(), row);
        Ok(())
    })
}

fn update_row<R: Row>(t: &mut Tables, mut row: R) -> Result<(), StorageError> {
    check_update(t, &row)?;
    row.set_version(row.version() + 1);
    R::table_mut(t).insert(row.key(), row);
    Ok(())
}

fn paginate<T: Clone>(rows: Vec<T>, page: PageRequest) -> Page<T> {
    let total = rows.len();
    let items = rows.into_iter().skip(page.offset).take(page.limit).collect();
    Page {
        items,
        total,
        offset: page.offset,
        limit: page.limit,
    }
}

// ── Trait implementations ────────────────────────────────────────────────────

#[async_trait]
impl SnapshotStore for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        let mut staged = tables.clone();
        for op in snapshot.ops {
            op(&mut staged)?;
        }
        *tables = staged;
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        drop(snapshot);
        Ok(())
    }
}

#[async_trait]
impl RequestRepository for MemoryStorage {
    async fn insert_request(
        &self,
        snapshot: &mut MemorySnapshot,
        request: DevelopmentRequest,
    ) -> Result<(), StorageError> {
        self.stage_insert(snapshot, request)
    }

    async fn get_request(&self, id: RequestId) -> Result<DevelopmentRequest, StorageError> {
        self.fetch(id)
    }

    async fn get_request_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        id: RequestId,
    ) -> Result<DevelopmentRequest, StorageError> {
        self.stage_guard(snapshot, id)
    }

    async fn update_request(
        &self,
        snapshot: &mut MemorySnapshot,
        request: DevelopmentRequest,
    ) -> Result<i64, StorageError> {
        self.stage_update(snapshot, request)
    }

    async fn list_requests(
        &self,
        filter: &RequestFilter,
        page: PageRequest,
    ) -> Result<Page<DevelopmentRequest>, StorageError> {
        let mut rows: Vec<_> = self.read(|t| {
            t.requests
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect()
        })?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(paginate(rows, page))
    }
}

#[async_trait]
impl ProposalRepository for MemoryStorage {
    async fn insert_proposal(
        &self,
        snapshot: &mut MemorySnapshot,
        proposal: Proposal,
    ) -> Result<(), StorageError> {
        self.stage_insert(snapshot, proposal)
    }

    async fn get_proposal(&self, id: ProposalId) -> Result<Proposal, StorageError> {
        self.fetch(id)
    }

    async fn update_proposal(
        &self,
        snapshot: &mut MemorySnapshot,
        proposal: Proposal,
    ) -> Result<i64, StorageError> {
        self.stage_update(snapshot, proposal)
    }

    async fn list_proposals(&self, request_id: RequestId) -> Result<Vec<Proposal>, StorageError> {
        let mut rows: Vec<_> = self.read(|t| {
            t.proposals
                .values()
                .filter(|p| p.request_id == request_id)
                .cloned()
                .collect()
        })?;
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn list_proposals_by_seller(
        &self,
        seller_id: UserId,
    ) -> Result<Vec<Proposal>, StorageError> {
        let mut rows: Vec<_> = self.read(|t| {
            t.proposals
                .values()
                .filter(|p| p.seller_id == seller_id)
                .cloned()
                .collect()
        })?;
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }
}

#[async_trait]
impl EscrowRepository for MemoryStorage {
    async fn insert_escrow(
        &self,
        snapshot: &mut MemorySnapshot,
        escrow: Escrow,
    ) -> Result<(), StorageError> {
        self.stage_insert(snapshot, escrow)
    }

    async fn get_escrow(&self, id: EscrowId) -> Result<Escrow, StorageError> {
        self.fetch(id)
    }

    async fn find_escrow_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<Escrow>, StorageError> {
        self.read(|t| {
            t.escrows
                .values()
                .find(|e| e.request_id == request_id)
                .cloned()
        })
    }

    async fn update_escrow(
        &self,
        snapshot: &mut MemorySnapshot,
        escrow: Escrow,
    ) -> Result<i64, StorageError> {
        self.stage_update(snapshot, escrow)
    }
}

#[async_trait]
impl VerificationRepository for MemoryStorage {
    async fn insert_verification(
        &self,
        snapshot: &mut MemorySnapshot,
        verification: Verification,
    ) -> Result<(), StorageError> {
        self.stage_insert(snapshot, verification)
    }

    async fn get_verification(&self, id: VerificationId) -> Result<Verification, StorageError> {
        self.fetch(id)
    }

    async fn update_verification(
        &self,
        snapshot: &mut MemorySnapshot,
        verification: Verification,
    ) -> Result<i64, StorageError> {
        self.stage_update(snapshot, verification)
    }

    async fn list_verifications(
        &self,
        filter: &VerificationFilter,
    ) -> Result<Vec<Verification>, StorageError> {
        let mut rows: Vec<_> = self.read(|t| {
            t.verifications
                .values()
                .filter(|v| filter.matches(v))
                .cloned()
                .collect()
        })?;
        rows.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn list_completed_verifications(
        &self,
        verifier_id: UserId,
        period: Period,
    ) -> Result<Vec<Verification>, StorageError> {
        let mut rows: Vec<_> = self.read(|t| {
            t.verifications
                .values()
                .filter(|v| {
                    v.verifier_id == Some(verifier_id)
                        && v.status.is_completed_work()
                        && v.completed_at.is_some_and(|at| period.contains(at))
                })
                .cloned()
                .collect()
        })?;
        rows.sort_by(|a, b| a.completed_at.cmp(&b.completed_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn verifiers_with_completed_work(
        &self,
        period: Period,
    ) -> Result<Vec<UserId>, StorageError> {
        let verifiers: BTreeSet<UserId> = self.read(|t| {
            t.verifications
                .values()
                .filter(|v| {
                    v.status.is_completed_work()
                        && v.completed_at.is_some_and(|at| period.contains(at))
                })
                .filter_map(|v| v.verifier_id)
                .collect()
        })?;
        Ok(verifiers.into_iter().collect())
    }
}

#[async_trait]
impl OrderRepository for MemoryStorage {
    async fn insert_order(
        &self,
        snapshot: &mut MemorySnapshot,
        order: Order,
    ) -> Result<(), StorageError> {
        self.stage_insert(snapshot, order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Order, StorageError> {
        self.fetch(id)
    }

    async fn update_order(
        &self,
        snapshot: &mut MemorySnapshot,
        order: Order,
    ) -> Result<i64, StorageError> {
        self.stage_update(snapshot, order)
    }

    async fn list_orders_by_escrow(&self, escrow_id: EscrowId) -> Result<Vec<Order>, StorageError> {
        self.read(|t| {
            t.orders
                .values()
                .filter(|o| o.escrow_id == Some(escrow_id))
                .cloned()
                .collect()
        })
    }

    async fn list_paid_orders(
        &self,
        seller_id: UserId,
        period: Period,
    ) -> Result<Vec<Order>, StorageError> {
        let mut rows: Vec<_> = self.read(|t| {
            t.orders
                .values()
                .filter(|o| {
                    o.seller_id == seller_id
                        && o.status == OrderStatus::Paid
                        && o.paid_at.is_some_and(|at| period.contains(at))
                })
                .cloned()
                .collect()
        })?;
        rows.sort_by(|a, b| a.paid_at.cmp(&b.paid_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn sellers_with_paid_orders(&self, period: Period) -> Result<Vec<UserId>, StorageError> {
        let sellers: BTreeSet<UserId> = self.read(|t| {
            t.orders
                .values()
                .filter(|o| {
                    o.status == OrderStatus::Paid
                        && o.paid_at.is_some_and(|at| period.contains(at))
                })
                .map(|o| o.seller_id)
                .collect()
        })?;
        Ok(sellers.into_iter().collect())
    }
}

#[async_trait]
impl SellerRepository for MemoryStorage {
    async fn upsert_seller(
        &self,
        snapshot: &mut MemorySnapshot,
        profile: SellerProfile,
    ) -> Result<i64, StorageError> {
        let exists = self.read(|t| t.sellers.contains_key(&profile.seller_id))?;
        if exists {
            return self.stage_update(snapshot, profile);
        }
        // Creation races are reported as version conflicts, not duplicates:
        // the loser read "no profile" and must re-read before writing.
        let version = profile.version;
        snapshot.ops.push(Box::new(move |t| {
            if t.sellers.contains_key(&profile.seller_id) {
                return Err(StorageError::conflict("seller", profile.seller_id, version));
            }
            t.sellers.insert(profile.seller_id, profile);
            Ok(())
        }));
        Ok(version)
    }

    async fn get_seller(&self, seller_id: UserId) -> Result<Option<SellerProfile>, StorageError> {
        self.read(|t| t.sellers.get(&seller_id).cloned())
    }
}

#[async_trait]
impl SettlementRepository for MemoryStorage {
    async fn insert_settlement(
        &self,
        snapshot: &mut MemorySnapshot,
        settlement: Settlement,
        items: Vec<SettlementItem>,
    ) -> Result<(), StorageError> {
        {
            let tables = self.lock()?;
            check_insert(&tables, &settlement)?;
        }
        snapshot.ops.push(Box::new(move |t| {
            check_insert(t, &settlement)?;
            t.settlement_items.insert(settlement.id, items);
            t.settlements.insert(settlement.id, settlement);
            Ok(())
        }));
        Ok(())
    }

    async fn get_settlement(&self, id: SettlementId) -> Result<Settlement, StorageError> {
        self.fetch(id)
    }

    async fn find_settlement(
        &self,
        seller_id: UserId,
        period: Period,
    ) -> Result<Option<Settlement>, StorageError> {
        self.read(|t| {
            t.settlements
                .values()
                .find(|s| s.seller_id == seller_id && s.period == period)
                .cloned()
        })
    }

    async fn list_settlements(&self, seller_id: UserId) -> Result<Vec<Settlement>, StorageError> {
        let mut rows: Vec<_> = self.read(|t| {
            t.settlements
                .values()
                .filter(|s| s.seller_id == seller_id)
                .cloned()
                .collect()
        })?;
        rows.sort_by(|a, b| a.period.start.cmp(&b.period.start));
        Ok(rows)
    }

    async fn list_settlement_items(
        &self,
        settlement_id: SettlementId,
    ) -> Result<Vec<SettlementItem>, StorageError> {
        self.read(|t| {
            t.settlement_items
                .get(&settlement_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    async fn update_settlement(
        &self,
        snapshot: &mut MemorySnapshot,
        settlement: Settlement,
    ) -> Result<i64, StorageError> {
        self.stage_update(snapshot, settlement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RequestStatus, SettlementStatus};
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn now() -> OffsetDateTime {
        datetime!(2026-03-01 12:00 UTC)
    }

    fn request() -> DevelopmentRequest {
        DevelopmentRequest {
            id: RequestId::new(),
            buyer_id: UserId::new(),
            title: "Inventory sync".into(),
            description: "Sync stock levels".into(),
            category: "integration".into(),
            budget_min: 100_000,
            budget_max: 300_000,
            timeline: "6 weeks".into(),
            requirements: serde_json::json!({}),
            status: RequestStatus::Open,
            selected_proposal_id: None,
            proposal_count: 0,
            created_at: now(),
            updated_at: now(),
            version: 0,
        }
    }

    fn settlement(seller_id: UserId, period: Period) -> Settlement {
        Settlement {
            id: SettlementId::new(),
            seller_id,
            period,
            currency: "USD".into(),
            total_amount: 0,
            platform_fee: 0,
            verification_earnings: 0,
            payout_amount: 0,
            status: SettlementStatus::Pending,
            payout_date: None,
            transfer_id: None,
            failure_reason: None,
            processing_since: None,
            created_at: now(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn snapshot_reads_do_not_see_own_writes() {
        let storage = MemoryStorage::new();
        let r = request();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage.insert_request(&mut snap, r.clone()).await.unwrap();
        assert!(storage.get_request(r.id).await.is_err());
        storage.commit_snapshot(snap).await.unwrap();
        assert_eq!(storage.get_request(r.id).await.unwrap(), r);
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let storage = MemoryStorage::new();
        let r = request();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage.insert_request(&mut snap, r.clone()).await.unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        // Second snapshot: one valid insert, one stale update.
        let other = request();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage.insert_request(&mut snap, other.clone()).await.unwrap();
        let mut stale = r.clone();
        stale.title = "edited".into();
        storage.update_request(&mut snap, stale.clone()).await.unwrap();

        // Intervening commit bumps the version.
        let mut snap2 = storage.begin_snapshot().await.unwrap();
        storage.update_request(&mut snap2, r.clone()).await.unwrap();
        storage.commit_snapshot(snap2).await.unwrap();

        let err = storage.commit_snapshot(snap).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(storage.get_request(other.id).await.is_err());
        assert_eq!(storage.get_request(r.id).await.unwrap().title, r.title);
    }

    #[tokio::test]
    async fn read_guard_fails_commit_after_intervening_write() {
        let storage = MemoryStorage::new();
        let r = request();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage.insert_request(&mut snap, r.clone()).await.unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let mut guarded = storage.begin_snapshot().await.unwrap();
        storage
            .get_request_for_update(&mut guarded, r.id)
            .await
            .unwrap();

        let mut writer = storage.begin_snapshot().await.unwrap();
        storage.update_request(&mut writer, r.clone()).await.unwrap();
        storage.commit_snapshot(writer).await.unwrap();

        let err = storage.commit_snapshot(guarded).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn overlapping_settlement_rejected() {
        let storage = MemoryStorage::new();
        let seller = UserId::new();
        let jan = Period::new(
            datetime!(2026-01-01 00:00 UTC),
            datetime!(2026-02-01 00:00 UTC),
        );
        let mid = Period::new(
            datetime!(2026-01-15 00:00 UTC),
            datetime!(2026-02-15 00:00 UTC),
        );
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .insert_settlement(&mut snap, settlement(seller, jan), vec![])
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let mut snap = storage.begin_snapshot().await.unwrap();
        let err = storage
            .insert_settlement(&mut snap, settlement(seller, mid), vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::UniqueViolation {
                constraint: constraint::SETTLEMENT_OVERLAP,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn seller_creation_race_reports_conflict() {
        let storage = MemoryStorage::new();
        let seller_id = UserId::new();
        let profile = |level| SellerProfile {
            seller_id,
            verification_level: level,
            payout_account_ref: None,
            updated_at: now(),
            version: 0,
        };
        let mut a = storage.begin_snapshot().await.unwrap();
        let mut b = storage.begin_snapshot().await.unwrap();
        storage.upsert_seller(&mut a, profile(2)).await.unwrap();
        storage.upsert_seller(&mut b, profile(1)).await.unwrap();
        storage.commit_snapshot(a).await.unwrap();
        assert!(storage.commit_snapshot(b).await.unwrap_err().is_conflict());
        let stored = storage.get_seller(seller_id).await.unwrap().unwrap();
        assert_eq!(stored.verification_level, 2);
    }

    #[tokio::test]
    async fn settlements_survive_a_fixture_round_trip() {
        let storage = MemoryStorage::new();
        let seller = UserId::new();
        let jan = Period::new(
            datetime!(2026-01-01 00:00 UTC),
            datetime!(2026-02-01 00:00 UTC),
        );
        let s = settlement(seller, jan);
        let item = SettlementItem {
            settlement_id: s.id,
            product_id: crate::id::ProductId::new(),
            order_count: 2,
            amount: 1_000,
            platform_fee: 150,
            payout_amount: 850,
        };
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .insert_settlement(&mut snap, s.clone(), vec![item.clone()])
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let json = serde_json::to_string(&storage.to_fixture().unwrap()).unwrap();
        let reloaded = MemoryStorage::from_fixture(serde_json::from_str(&json).unwrap())
            .await
            .unwrap();
        let found = reloaded.find_settlement(seller, jan).await.unwrap().unwrap();
        assert_eq!(found.id, s.id);
        assert_eq!(reloaded.list_settlement_items(s.id).await.unwrap(), vec![item]);

        // The reloaded period is still closed.
        let mut snap = reloaded.begin_snapshot().await.unwrap();
        let err = reloaded
            .insert_settlement(&mut snap, settlement(seller, jan), vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::UniqueViolation {
                constraint: constraint::SETTLEMENT_PERIOD,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn orphan_settlement_items_are_rejected() {
        let fixture = LedgerFixture {
            settlement_items: vec![SettlementItem {
                settlement_id: SettlementId::new(),
                product_id: crate::id::ProductId::new(),
                order_count: 1,
                amount: 10,
                platform_fee: 1,
                payout_amount: 9,
            }],
            ..Default::default()
        };
        let err = MemoryStorage::from_fixture(fixture).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { entity: "settlement", .. }));
    }

    #[tokio::test]
    async fn fixture_rows_are_loaded() {
        let fixture = LedgerFixture {
            requests: vec![request(), request()],
            ..Default::default()
        };
        let storage = MemoryStorage::from_fixture(fixture).await.unwrap();
        let page = storage
            .list_requests(&RequestFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }
}
