//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! aborted writes are discarded, and a commit that fails applies nothing.

use std::future::Future;

use super::{make_proposal, make_request, seed_request, TestResult};
use crate::id::UserId;
use crate::MarketStorage;

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "uncommitted_insert_invisible",
            uncommitted_insert_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "aborted_insert_discarded",
            aborted_insert_discarded(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "multi_record_commit_is_atomic",
            multi_record_commit_is_atomic(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "failed_commit_applies_nothing",
            failed_commit_applies_nothing(factory).await,
        ),
    ]
}

async fn uncommitted_insert_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_request(&mut snap, request.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;

    if storage.get_request(request.id).await.is_ok() {
        return Err("uncommitted request visible to get_request".to_string());
    }
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    storage
        .get_request(request.id)
        .await
        .map_err(|e| format!("committed request not visible: {e}"))?;
    Ok(())
}

async fn aborted_insert_discarded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_request(&mut snap, request.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    if storage.get_request(request.id).await.is_ok() {
        return Err("aborted request is visible".to_string());
    }
    Ok(())
}

async fn multi_record_commit_is_atomic<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;

    let proposal = make_proposal(request.id, UserId::new());
    let mut bumped = request.clone();
    bumped.proposal_count = 1;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_proposal(&mut snap, proposal.clone())
        .await
        .map_err(|e| format!("insert proposal: {e}"))?;
    storage
        .update_request(&mut snap, bumped)
        .await
        .map_err(|e| format!("update request: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let stored = storage
        .get_request(request.id)
        .await
        .map_err(|e| format!("get request: {e}"))?;
    if stored.proposal_count != 1 || stored.version != 1 {
        return Err(format!(
            "expected count 1 at version 1, got {} at {}",
            stored.proposal_count, stored.version
        ));
    }
    storage
        .get_proposal(proposal.id)
        .await
        .map_err(|e| format!("proposal missing: {e}"))?;
    Ok(())
}

/// A snapshot holding a valid insert and a stale update must fail as a whole.
async fn failed_commit_applies_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;

    let proposal = make_proposal(request.id, UserId::new());
    let mut doomed = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_proposal(&mut doomed, proposal.clone())
        .await
        .map_err(|e| format!("insert proposal: {e}"))?;
    storage
        .update_request(&mut doomed, request.clone())
        .await
        .map_err(|e| format!("stage update: {e}"))?;

    // Someone else moves the request forward first.
    let mut other = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_request(&mut other, request.clone())
        .await
        .map_err(|e| format!("other update: {e}"))?;
    storage
        .commit_snapshot(other)
        .await
        .map_err(|e| format!("other commit: {e}"))?;

    match storage.commit_snapshot(doomed).await {
        Err(e) if e.is_conflict() => {}
        other => return Err(format!("expected ConcurrentConflict, got {other:?}")),
    }
    if storage.get_proposal(proposal.id).await.is_ok() {
        return Err("proposal from failed commit is visible".to_string());
    }
    Ok(())
}
