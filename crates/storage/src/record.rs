use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::id::{
    EscrowId, OrderId, ProductId, ProposalId, RequestId, SettlementId, UserId, VerificationId,
};

// ── Development requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Open => "OPEN",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    /// Legal edges: OPEN→IN_PROGRESS, IN_PROGRESS→COMPLETED,
    /// OPEN→CANCELLED, IN_PROGRESS→CANCELLED.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Open, InProgress) | (InProgress, Completed) | (Open, Cancelled) | (InProgress, Cancelled)
        )
    }

    /// Statuses in which a proposal has been selected.
    pub fn has_selection(&self) -> bool {
        matches!(self, RequestStatus::InProgress | RequestStatus::Completed)
    }
}

/// A buyer's posted specification seeking a custom build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevelopmentRequest {
    pub id: RequestId,
    pub buyer_id: UserId,
    pub title: String,
    pub description: String,
    pub category: String,
    /// Minor currency units.
    pub budget_min: i64,
    pub budget_max: i64,
    pub timeline: String,
    /// Opaque structured payload supplied by the buyer.
    pub requirements: serde_json::Value,
    pub status: RequestStatus,
    pub selected_proposal_id: Option<ProposalId>,
    /// Number of proposals ever submitted. Buyer-editable fields are frozen
    /// once this is non-zero.
    pub proposal_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub version: i64,
}

impl DevelopmentRequest {
    pub fn budget_contains(&self, amount: i64) -> bool {
        self.budget_min <= amount && amount <= self.budget_max
    }
}

// ── Proposals ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "PENDING",
            ProposalStatus::Accepted => "ACCEPTED",
            ProposalStatus::Rejected => "REJECTED",
            ProposalStatus::Withdrawn => "WITHDRAWN",
        }
    }

    /// Withdrawn proposals no longer count towards the one-per-seller rule.
    pub fn is_active(&self) -> bool {
        !matches!(self, ProposalStatus::Withdrawn)
    }
}

/// A seller's bid against a development request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub request_id: RequestId,
    pub seller_id: UserId,
    pub price: i64,
    pub timeline: String,
    pub description: String,
    pub status: ProposalStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub selected_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub version: i64,
}

// ── Escrow ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Pending,
    Funded,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "PENDING",
            EscrowStatus::Funded => "FUNDED",
            EscrowStatus::Released => "RELEASED",
            EscrowStatus::Refunded => "REFUNDED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded)
    }

    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, next),
            (Pending, Funded) | (Funded, Released) | (Pending, Refunded) | (Funded, Refunded)
        )
    }
}

/// Funds held against an accepted proposal pending delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub request_id: RequestId,
    pub proposal_id: ProposalId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub amount: i64,
    pub status: EscrowStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub funded_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub version: i64,
}

// ── Verification ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Approved,
    Rejected,
    Cancelled,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "PENDING",
            VerificationStatus::Assigned => "ASSIGNED",
            VerificationStatus::InProgress => "IN_PROGRESS",
            VerificationStatus::Completed => "COMPLETED",
            VerificationStatus::Approved => "APPROVED",
            VerificationStatus::Rejected => "REJECTED",
            VerificationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationStatus::Approved
                | VerificationStatus::Rejected
                | VerificationStatus::Cancelled
        )
    }

    /// Whether a verifier has finished reviewing and earned their share.
    pub fn is_completed_work(&self) -> bool {
        matches!(
            self,
            VerificationStatus::Completed | VerificationStatus::Approved
        )
    }

    pub fn can_transition_to(&self, next: VerificationStatus) -> bool {
        use VerificationStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Assigned, InProgress)
                | (InProgress, Completed)
                | (Completed, Approved)
                | (Completed, Rejected)
                | (Pending, Cancelled)
                | (Assigned, Cancelled)
                | (InProgress, Cancelled)
        )
    }
}

/// A paid quality review of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub id: VerificationId,
    pub product_id: ProductId,
    /// Owner of the product under review.
    pub seller_id: UserId,
    pub verifier_id: Option<UserId>,
    /// 0 = automated, 1–3 = increasingly thorough manual review.
    pub level: u8,
    pub status: VerificationStatus,
    pub fee: i64,
    pub platform_share: i64,
    pub verifier_share: i64,
    pub score: Option<u8>,
    pub comments: Option<String>,
    #[serde(default)]
    pub badges: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub assigned_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub version: i64,
}

impl Verification {
    /// Time from assignment to completion, once both are known.
    pub fn turnaround(&self) -> Option<time::Duration> {
        match (self.assigned_at, self.completed_at) {
            (Some(assigned), Some(completed)) => Some(completed - assigned),
            _ => None,
        }
    }
}

// ── Orders & sellers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Refunded,
    Cancelled,
}

/// A captured sale. The platform fee is fixed when the order is paid and is
/// never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub seller_id: UserId,
    pub buyer_id: Option<UserId>,
    pub product_id: ProductId,
    pub escrow_id: Option<EscrowId>,
    pub amount: i64,
    pub platform_fee: i64,
    /// Seller verification level at capture time, kept for audit.
    pub seller_level: u8,
    pub status: OrderStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellerProfile {
    pub seller_id: UserId,
    pub verification_level: u8,
    /// Destination reference understood by the funds-transfer provider.
    pub payout_account_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub version: i64,
}

// ── Settlement ───────────────────────────────────────────────────────────────

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Period {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start <= at && at < self.end
    }

    pub fn overlaps(&self, other: &Period) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Paid,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Processing => "PROCESSING",
            SettlementStatus::Paid => "PAID",
            SettlementStatus::Failed => "FAILED",
        }
    }
}

/// Per-seller aggregation of a period's sales and verification income.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub seller_id: UserId,
    pub period: Period,
    pub currency: String,
    pub total_amount: i64,
    pub platform_fee: i64,
    pub verification_earnings: i64,
    /// `total_amount - platform_fee + verification_earnings`
    pub payout_amount: i64,
    pub status: SettlementStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub payout_date: Option<OffsetDateTime>,
    pub transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    /// Set when a dispatcher moves the row to PROCESSING.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub processing_since: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub version: i64,
}

/// Seller-facing breakdown row: one per product sold in the period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementItem {
    pub settlement_id: SettlementId,
    pub product_id: ProductId,
    pub order_count: u32,
    pub amount: i64,
    pub platform_fee: i64,
    pub payout_amount: i64,
}

// ── Query types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub category: Option<String>,
    pub buyer_id: Option<UserId>,
    /// Keep requests whose budget range intersects `[min, max]`.
    pub budget_overlaps: Option<(i64, i64)>,
}

impl RequestFilter {
    pub fn matches(&self, request: &DevelopmentRequest) -> bool {
        if let Some(status) = self.status {
            if request.status != status {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if &request.category != category {
                return false;
            }
        }
        if let Some(buyer_id) = self.buyer_id {
            if request.buyer_id != buyer_id {
                return false;
            }
        }
        if let Some((min, max)) = self.budget_overlaps {
            if request.budget_max < min || request.budget_min > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationFilter {
    pub status: Option<VerificationStatus>,
    pub level: Option<u8>,
    pub verifier_id: Option<UserId>,
    pub seller_id: Option<UserId>,
    pub product_id: Option<ProductId>,
}

impl VerificationFilter {
    pub fn matches(&self, v: &Verification) -> bool {
        self.status.is_none_or(|s| v.status == s)
            && self.level.is_none_or(|l| v.level == l)
            && self.verifier_id.is_none_or(|id| v.verifier_id == Some(id))
            && self.seller_id.is_none_or(|id| v.seller_id == id)
            && self.product_id.is_none_or(|id| v.product_id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}
