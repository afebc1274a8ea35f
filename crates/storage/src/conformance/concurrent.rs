use std::future::Future;
use std::sync::Arc;

use super::{make_escrow, make_request, seed_request, TestResult};
use crate::id::UserId;
use crate::record::RequestStatus;
use crate::{MarketStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_updates_exactly_one_wins",
            concurrent_updates_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_escrow_inserts_exactly_one_wins",
            concurrent_escrow_inserts_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_updates_different_requests_all_succeed",
            concurrent_updates_different_requests_all_succeed(factory).await,
        ),
    ]
}

fn tally(outcomes: Vec<bool>) -> Result<(), String> {
    let winners = outcomes.iter().filter(|won| **won).count();
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

async fn join_all<T>(
    handles: Vec<tokio::task::JoinHandle<Result<T, StorageError>>>,
) -> Result<Vec<T>, String> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(
            handle
                .await
                .map_err(|e| format!("task panic: {e}"))?
                .map_err(|e| format!("storage error: {e}"))?,
        );
    }
    Ok(out)
}

// ── Concurrent update: exactly one wins ─────────────────────────────────────

/// N tasks each move the same OPEN request forward from version 0. Exactly
/// one commit succeeds; the rest get ConcurrentConflict, either when
/// staging the update or at commit.
async fn concurrent_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let request = make_request(UserId::new());
    seed_request(storage.as_ref(), request.clone()).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let mut next = request.clone();
        next.status = RequestStatus::InProgress;
        next.title = format!("winner-{i}");
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let staged = s.update_request(&mut snap, next).await;
            let result = match staged {
                Ok(_) => s.commit_snapshot(snap).await,
                Err(e) => {
                    s.abort_snapshot(snap).await?;
                    Err(e)
                }
            };
            match result {
                Ok(()) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    tally(join_all(handles).await?)?;

    let stored = storage
        .get_request(request.id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.version != 1 {
        return Err(format!("expected final version 1, got {}", stored.version));
    }
    Ok(())
}

/// N tasks each insert an escrow for the same request. Exactly one commit
/// succeeds; the rest hit the one-escrow-per-request constraint.
async fn concurrent_escrow_inserts_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let request = make_request(UserId::new());
    seed_request(storage.as_ref(), request.clone()).await?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let escrow = make_escrow(request.id);
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let result = match s.insert_escrow(&mut snap, escrow).await {
                Ok(()) => s.commit_snapshot(snap).await,
                Err(e) => {
                    s.abort_snapshot(snap).await?;
                    Err(e)
                }
            };
            match result {
                Ok(()) => Ok(true),
                Err(StorageError::UniqueViolation { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    tally(join_all(handles).await?)
}

/// N tasks each update a different request. No false conflicts.
async fn concurrent_updates_different_requests_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let mut requests = Vec::new();
    for _ in 0..N {
        let request = make_request(UserId::new());
        seed_request(storage.as_ref(), request.clone()).await?;
        requests.push(request);
    }

    let mut handles = Vec::new();
    for request in requests {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.update_request(&mut snap, request).await?;
            s.commit_snapshot(snap).await?;
            Ok::<(), StorageError>(())
        }));
    }

    join_all(handles).await?;
    Ok(())
}
