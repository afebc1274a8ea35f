//! Conformance test suite for [`MarketStorage`] implementations.
//!
//! Any backend can run this suite to check that it honours the contract the
//! marketplace engine relies on:
//!
//! - **Initialization**: inserts, lookups, duplicate detection
//! - **Snapshot isolation**: uncommitted writes invisible, failed commits atomic
//! - **Version validation / OCC**: stale updates and read guards conflict
//! - **Constraints**: one active proposal per seller, one escrow per request,
//!   no overlapping settlements
//! - **Concurrency**: racing writers produce exactly one winner
//!
//! # Usage
//!
//! ```ignore
//! use bazaar_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn memory_conformance() {
//!     let report = run_conformance_suite(|| async { MemoryStorage::new() }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod constraint;
mod init;
mod snapshot;
mod version;

use std::fmt;
use std::future::Future;

use time::macros::datetime;
use time::OffsetDateTime;

use crate::id::{EscrowId, ProposalId, RequestId, SettlementId, UserId};
use crate::record::{
    DevelopmentRequest, Escrow, EscrowStatus, Period, Proposal, ProposalStatus, RequestStatus,
    Settlement, SettlementStatus,
};
use crate::MarketStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "init", "snapshot", "constraint").
    pub category: String,
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in self.results.iter().filter(|r| !r.passed) {
            writeln!(
                f,
                "  FAIL [{}/{}]: {}",
                r.category,
                r.name,
                r.message.as_deref().unwrap_or("(no message)")
            )?;
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// `factory` is called once per test to create a fresh, empty store.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(init::run_init_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(version::run_version_tests(&factory).await);
    results.extend(constraint::run_constraint_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn fixed_now() -> OffsetDateTime {
    datetime!(2025-01-01 00:00 UTC)
}

fn make_request(buyer_id: UserId) -> DevelopmentRequest {
    DevelopmentRequest {
        id: RequestId::new(),
        buyer_id,
        title: "Conformance request".to_string(),
        description: "fixture".to_string(),
        category: "test".to_string(),
        budget_min: 100_000,
        budget_max: 300_000,
        timeline: "2 weeks".to_string(),
        requirements: serde_json::json!({"test": true}),
        status: RequestStatus::Open,
        selected_proposal_id: None,
        proposal_count: 0,
        created_at: fixed_now(),
        updated_at: fixed_now(),
        version: 0,
    }
}

fn make_proposal(request_id: RequestId, seller_id: UserId) -> Proposal {
    Proposal {
        id: ProposalId::new(),
        request_id,
        seller_id,
        price: 200_000,
        timeline: "2 weeks".to_string(),
        description: "fixture".to_string(),
        status: ProposalStatus::Pending,
        selected_at: None,
        created_at: fixed_now(),
        updated_at: fixed_now(),
        version: 0,
    }
}

fn make_escrow(request_id: RequestId) -> Escrow {
    Escrow {
        id: EscrowId::new(),
        request_id,
        proposal_id: ProposalId::new(),
        buyer_id: UserId::new(),
        seller_id: UserId::new(),
        amount: 200_000,
        status: EscrowStatus::Pending,
        created_at: fixed_now(),
        funded_at: None,
        closed_at: None,
        version: 0,
    }
}

fn make_settlement(seller_id: UserId, period: Period) -> Settlement {
    Settlement {
        id: SettlementId::new(),
        seller_id,
        period,
        currency: "USD".to_string(),
        total_amount: 0,
        platform_fee: 0,
        verification_earnings: 0,
        payout_amount: 0,
        status: SettlementStatus::Pending,
        payout_date: None,
        transfer_id: None,
        failure_reason: None,
        processing_since: None,
        created_at: fixed_now(),
        version: 0,
    }
}

fn january() -> Period {
    Period::new(
        datetime!(2025-01-01 00:00 UTC),
        datetime!(2025-02-01 00:00 UTC),
    )
}

/// Insert `request` in its own committed snapshot.
async fn seed_request<S: MarketStorage>(
    storage: &S,
    request: DevelopmentRequest,
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_request(&mut snap, request)
        .await
        .map_err(|e| format!("insert request: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit seed: {e}"))
}
