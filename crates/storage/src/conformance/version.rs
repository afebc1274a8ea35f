//! Version validation (OCC) conformance tests.
//!
//! Runs conflicting writers sequentially: the interleavings are fixed so
//! the expected outcome is deterministic.

use std::future::Future;

use super::{make_request, seed_request, TestResult};
use crate::id::UserId;
use crate::record::RequestStatus;
use crate::{MarketStorage, StorageError};

pub(super) async fn run_version_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "version",
            "update_returns_incremented_version",
            update_returns_incremented_version(factory).await,
        ),
        TestResult::from_result(
            "version",
            "stale_update_conflicts",
            stale_update_conflicts(factory).await,
        ),
        TestResult::from_result(
            "version",
            "conflict_error_has_correct_fields",
            conflict_error_has_correct_fields(factory).await,
        ),
        TestResult::from_result(
            "version",
            "read_guard_conflicts_after_intervening_write",
            read_guard_conflicts_after_intervening_write(factory).await,
        ),
    ]
}

async fn update_returns_incremented_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;

    for expected in 1..=3 {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        let version = storage
            .update_request(&mut snap, request.clone())
            .await
            .map_err(|e| format!("update: {e}"))?;
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
        if version != expected {
            return Err(format!("expected version {expected}, got {version}"));
        }
        request.version = version;
    }
    Ok(())
}

async fn stale_update_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;

    let mut first = request.clone();
    first.status = RequestStatus::InProgress;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_request(&mut snap, first)
        .await
        .map_err(|e| format!("first update: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("first commit: {e}"))?;

    // Second writer still holds version 0.
    let mut second = request.clone();
    second.status = RequestStatus::Cancelled;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = match storage.update_request(&mut snap, second).await {
        Ok(_) => storage.commit_snapshot(snap).await,
        Err(e) => Err(e),
    };
    if !result.as_ref().is_err_and(StorageError::is_conflict) {
        return Err(format!("expected ConcurrentConflict, got {result:?}"));
    }

    let stored = storage
        .get_request(request.id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.status != RequestStatus::InProgress {
        return Err(format!("stale write leaked: status {:?}", stored.status));
    }
    Ok(())
}

async fn conflict_error_has_correct_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;
    request.version = 7;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = match storage.update_request(&mut snap, request.clone()).await {
        Ok(_) => storage.commit_snapshot(snap).await,
        Err(e) => Err(e),
    };
    match result {
        Err(StorageError::ConcurrentConflict {
            entity,
            id,
            expected_version,
        }) => {
            if entity != "request" || id != request.id.to_string() || expected_version != 7 {
                return Err(format!(
                    "wrong fields: entity={entity} id={id} expected_version={expected_version}"
                ));
            }
            Ok(())
        }
        other => Err(format!("expected ConcurrentConflict, got {other:?}")),
    }
}

async fn read_guard_conflicts_after_intervening_write<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;

    let mut guarded = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let read = storage
        .get_request_for_update(&mut guarded, request.id)
        .await
        .map_err(|e| format!("guarded read: {e}"))?;
    if read.version != 0 {
        return Err(format!("guarded read saw version {}", read.version));
    }

    let mut writer = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_request(&mut writer, request.clone())
        .await
        .map_err(|e| format!("writer update: {e}"))?;
    storage
        .commit_snapshot(writer)
        .await
        .map_err(|e| format!("writer commit: {e}"))?;

    match storage.commit_snapshot(guarded).await {
        Err(e) if e.is_conflict() => Ok(()),
        other => Err(format!("expected guard conflict, got {other:?}")),
    }
}
