use std::future::Future;

use super::{make_request, seed_request, TestResult};
use crate::id::{RequestId, UserId};
use crate::record::{PageRequest, RequestFilter, RequestStatus, SellerProfile};
use crate::{MarketStorage, StorageError};

pub(super) async fn run_init_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "init",
            "inserted_request_readable_at_version_0",
            inserted_request_readable_at_version_0(factory).await,
        ),
        TestResult::from_result(
            "init",
            "missing_request_returns_not_found",
            missing_request_returns_not_found(factory).await,
        ),
        TestResult::from_result(
            "init",
            "duplicate_insert_returns_already_exists",
            duplicate_insert_returns_already_exists(factory).await,
        ),
        TestResult::from_result(
            "init",
            "list_requests_filters_and_pages",
            list_requests_filters_and_pages(factory).await,
        ),
        TestResult::from_result(
            "init",
            "missing_seller_is_none",
            missing_seller_is_none(factory).await,
        ),
        TestResult::from_result(
            "init",
            "upsert_creates_then_updates_seller",
            upsert_creates_then_updates_seller(factory).await,
        ),
    ]
}

async fn inserted_request_readable_at_version_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;

    let stored = storage
        .get_request(request.id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.version != 0 {
        return Err(format!("expected version 0, got {}", stored.version));
    }
    if stored != request {
        return Err(format!("stored record differs: {stored:?}"));
    }
    Ok(())
}

async fn missing_request_returns_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_request(RequestId::new()).await {
        Err(StorageError::NotFound { entity, .. }) if entity == "request" => Ok(()),
        other => Err(format!("expected NotFound, got {other:?}")),
    }
}

async fn duplicate_insert_returns_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let request = make_request(UserId::new());
    seed_request(&storage, request.clone()).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let staged = storage.insert_request(&mut snap, request).await;
    let result = match staged {
        Err(e) => Err(e),
        Ok(()) => storage.commit_snapshot(snap).await,
    };
    match result {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        other => Err(format!("expected AlreadyExists, got {other:?}")),
    }
}

async fn list_requests_filters_and_pages<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let buyer = UserId::new();
    for _ in 0..3 {
        seed_request(&storage, make_request(buyer)).await?;
    }
    seed_request(&storage, make_request(UserId::new())).await?;

    let filter = RequestFilter {
        buyer_id: Some(buyer),
        status: Some(RequestStatus::Open),
        ..Default::default()
    };
    let page = storage
        .list_requests(&filter, PageRequest { offset: 0, limit: 2 })
        .await
        .map_err(|e| format!("list: {e}"))?;
    if page.total != 3 || page.items.len() != 2 || !page.has_more() {
        return Err(format!(
            "expected 2 of 3 with more, got {} of {}",
            page.items.len(),
            page.total
        ));
    }
    let rest = storage
        .list_requests(&filter, PageRequest { offset: 2, limit: 2 })
        .await
        .map_err(|e| format!("list: {e}"))?;
    if rest.items.len() != 1 || rest.has_more() {
        return Err(format!("expected final page of 1, got {}", rest.items.len()));
    }
    Ok(())
}

async fn missing_seller_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_seller(UserId::new()).await {
        Ok(None) => Ok(()),
        other => Err(format!("expected Ok(None), got {other:?}")),
    }
}

async fn upsert_creates_then_updates_seller<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: MarketStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let profile = SellerProfile {
        seller_id: UserId::new(),
        verification_level: 1,
        payout_account_ref: Some("acct_1".to_string()),
        updated_at: super::fixed_now(),
        version: 0,
    };

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .upsert_seller(&mut snap, profile.clone())
        .await
        .map_err(|e| format!("create: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit create: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let mut raised = profile.clone();
    raised.verification_level = 3;
    let version = storage
        .upsert_seller(&mut snap, raised)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit update: {e}"))?;

    let stored = storage
        .get_seller(profile.seller_id)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("seller missing after upsert")?;
    if stored.verification_level != 3 || stored.version != 1 || version != 1 {
        return Err(format!(
            "expected level 3 at version 1, got level {} at version {} (returned {version})",
            stored.verification_level, stored.version
        ));
    }
    Ok(())
}
