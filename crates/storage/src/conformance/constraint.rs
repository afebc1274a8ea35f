//! Uniqueness constraint conformance tests.

use std::future::Future;

use time::macros::datetime;

use super::{
    january, make_escrow, make_proposal, make_request, make_settlement, seed_request, TestResult,
};
use crate::error::constraint;
use crate::id::UserId;
use crate::record::{Period, ProposalStatus};
use crate::{MarketStorage, StorageError};

pub(super) async fn run_constraint_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "constraint",
            "second_active_proposal_rejected",
            second_active_proposal_rejected(factory).await,
        ),
        TestResult::from_result(
            "constraint",
            "withdrawn_proposal_allows_resubmission",
            withdrawn_proposal_allows_resubmission(factory).await,
        ),
        TestResult::from_result(
            "constraint",
            "second_escrow_rejected",
            second_escrow_rejected(factory).await,
        ),
        TestResult::from_result(
            "constraint",
            "duplicate_settlement_period_rejected",
            duplicate_settlement_period_rejected(factory).await,
        ),
        TestResult::from_result(
            "constraint",
            "overlapping_settlement_rejected",
            overlapping_settlement_rejected(factory).await,
        ),
        TestResult::from_result(
            "constraint",
            "adjacent_settlements_allowed",
            adjacent_settlements_allowed(factory).await,
        ),
    ]
}

/// Stage `write` in a fresh snapshot and commit it, returning the first error.
macro_rules! write_and_commit {
    ($storage:expr, |$snap:ident| $write:expr) => {{
        let mut $snap = $storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        match $write.await {
            Ok(_) => $storage.commit_snapshot($snap).await,
            Err(e) => Err(e),
        }
    }};
}

fn expect_violation(result: Result<(), StorageError>, expected: &str) -> Result<(), String> {
    match result {
        Err(StorageError::UniqueViolation { constraint, .. }) if constraint == expected => Ok(()),
        other => Err(format!("expected {expected} violation, got {other:?}")),
    }
}

async fn second_active_proposal_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;
    let seller = UserId::new();

    write_and_commit!(storage, |snap| storage
        .insert_proposal(&mut snap, make_proposal(request.id, seller)))
    .map_err(|e| format!("first proposal: {e}"))?;

    let result = write_and_commit!(storage, |snap| storage
        .insert_proposal(&mut snap, make_proposal(request.id, seller)));
    expect_violation(result, constraint::ACTIVE_PROPOSAL_PER_SELLER)
}

async fn withdrawn_proposal_allows_resubmission<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;
    let seller = UserId::new();

    let mut first = make_proposal(request.id, seller);
    write_and_commit!(storage, |snap| storage
        .insert_proposal(&mut snap, first.clone()))
    .map_err(|e| format!("first proposal: {e}"))?;

    first.status = ProposalStatus::Withdrawn;
    write_and_commit!(storage, |snap| storage.update_proposal(&mut snap, first.clone()))
        .map_err(|e| format!("withdraw: {e}"))?;

    write_and_commit!(storage, |snap| storage
        .insert_proposal(&mut snap, make_proposal(request.id, seller)))
    .map_err(|e| format!("resubmission rejected: {e}"))
}

async fn second_escrow_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;

    write_and_commit!(storage, |snap| storage
        .insert_escrow(&mut snap, make_escrow(request.id)))
    .map_err(|e| format!("first escrow: {e}"))?;

    let result = write_and_commit!(storage, |snap| storage
        .insert_escrow(&mut snap, make_escrow(request.id)));
    expect_violation(result, constraint::ESCROW_PER_REQUEST)
}

async fn duplicate_settlement_period_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let seller = UserId::new();

    write_and_commit!(storage, |snap| storage.insert_settlement(
        &mut snap,
        make_settlement(seller, january()),
        vec![]
    ))
    .map_err(|e| format!("first settlement: {e}"))?;

    let result = write_and_commit!(storage, |snap| storage.insert_settlement(
        &mut snap,
        make_settlement(seller, january()),
        vec![]
    ));
    expect_violation(result, constraint::SETTLEMENT_PERIOD)
}

async fn overlapping_settlement_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let seller = UserId::new();

    write_and_commit!(storage, |snap| storage.insert_settlement(
        &mut snap,
        make_settlement(seller, january()),
        vec![]
    ))
    .map_err(|e| format!("first settlement: {e}"))?;

    let straddle = Period::new(
        datetime!(2025-01-15 00:00 UTC),
        datetime!(2025-02-15 00:00 UTC),
    );
    let result = write_and_commit!(storage, |snap| storage.insert_settlement(
        &mut snap,
        make_settlement(seller, straddle),
        vec![]
    ));
    expect_violation(result, constraint::SETTLEMENT_OVERLAP)
}

async fn adjacent_settlements_allowed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let seller = UserId::new();
    let february = Period::new(
        datetime!(2025-02-01 00:00 UTC),
        datetime!(2025-03-01 00:00 UTC),
    );

    for period in [january(), february] {
        write_and_commit!(storage, |snap| storage.insert_settlement(
            &mut snap,
            make_settlement(seller, period),
            vec![]
        ))
        .map_err(|e| format!("settlement {}: {e}", period.start))?;
    }

    // Another seller may settle the same period.
    write_and_commit!(storage, |snap| storage.insert_settlement(
        &mut snap,
        make_settlement(UserId::new(), january()),
        vec![]
    ))
    .map_err(|e| format!("other seller: {e}"))?;

    let listed = storage
        .list_settlements(seller)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 2 || listed[0].period != january() {
        return Err(format!("expected 2 settlements oldest first, got {listed:?}"));
    }
    Ok(())
}
