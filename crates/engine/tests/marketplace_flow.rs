use std::sync::Arc;

use bazaar_engine::notify::RecordingNotifier;
use bazaar_engine::{
    BusinessRuleKind, Caller, Clock, ConflictKind, FixedClock, MarketConfig, MarketError, Marketplace,
    NewProposal, NewRequest, NotificationEvent, ProposalPatch, RequestPatch, Review,
};
use bazaar_storage::{
    EscrowStatus, MemoryStorage, OrderStatus, PageRequest, ProductId, ProposalStatus,
    OrderRepository, RequestFilter, RequestStatus, SellerRepository, UserId, VerificationStatus,
};
use time::macros::datetime;

struct Harness {
    market: Marketplace<MemoryStorage>,
    clock: Arc<FixedClock>,
    events: RecordingNotifier,
}

fn harness() -> Harness {
    let clock = Arc::new(FixedClock::new(datetime!(2026-01-15 09:00 UTC)));
    let events = RecordingNotifier::new();
    let market = Marketplace::new(Arc::new(MemoryStorage::new()), MarketConfig::default())
        .with_clock(clock.clone())
        .with_notifier(Arc::new(events.clone()));
    Harness {
        market,
        clock,
        events,
    }
}

fn new_request() -> NewRequest {
    NewRequest {
        title: "Inventory sync plugin".into(),
        description: "Sync stock levels between two storefronts".into(),
        category: "integrations".into(),
        budget_min: 100_000,
        budget_max: 300_000,
        timeline: "4 weeks".into(),
        requirements: serde_json::json!({ "platforms": ["shopify", "woocommerce"] }),
    }
}

fn bid(request_id: bazaar_storage::RequestId, price: i64) -> NewProposal {
    NewProposal {
        request_id,
        price,
        timeline: "3 weeks".into(),
        description: "Fixed-price build with tests".into(),
    }
}

#[tokio::test]
async fn proposal_price_must_fit_budget() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let seller = Caller::seller(UserId::new());
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();

    let err = h
        .market
        .proposals()
        .create(&seller, bid(request.id, 500_000))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MarketError::BusinessRule(BusinessRuleKind::PriceOutOfRange { price: 500_000, .. })
    ));

    let proposal = h
        .market
        .proposals()
        .create(&seller, bid(request.id, 200_000))
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::Pending);
    assert_eq!(h.market.requests().get(request.id).await.unwrap().proposal_count, 1);
}

#[tokio::test]
async fn self_proposal_is_forbidden_in_any_status() {
    let h = harness();
    let id = UserId::new();
    let request = h
        .market
        .requests()
        .create(&Caller::buyer(id), new_request())
        .await
        .unwrap();
    let err = h
        .market
        .proposals()
        .create(&Caller::seller(id), bid(request.id, 200_000))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Forbidden(_)));

    h.market.requests().cancel(request.id, &Caller::buyer(id)).await.unwrap();
    let err = h
        .market
        .proposals()
        .create(&Caller::seller(id), bid(request.id, 200_000))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Forbidden(_)));
}

#[tokio::test]
async fn duplicate_proposal_rejected_until_withdrawn() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let seller = Caller::seller(UserId::new());
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let first = h
        .market
        .proposals()
        .create(&seller, bid(request.id, 150_000))
        .await
        .unwrap();

    let err = h
        .market
        .proposals()
        .create(&seller, bid(request.id, 160_000))
        .await
        .unwrap_err();
    assert!(err.is_conflict(&ConflictKind::DuplicateProposal));

    h.market.proposals().withdraw(first.id, &seller).await.unwrap();
    let second = h
        .market
        .proposals()
        .create(&seller, bid(request.id, 160_000))
        .await
        .unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn request_locks_once_a_proposal_exists() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();

    let retitled = h
        .market
        .requests()
        .update(
            request.id,
            &buyer,
            RequestPatch {
                title: Some("Inventory sync v2".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(retitled.title, "Inventory sync v2");

    h.market
        .proposals()
        .create(&Caller::seller(UserId::new()), bid(request.id, 120_000))
        .await
        .unwrap();

    let err = h
        .market
        .requests()
        .update(
            request.id,
            &buyer,
            RequestPatch {
                budget_max: Some(400_000),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict(&ConflictKind::RequestLocked));
    assert_eq!(err.to_string(), "conflict: request locked");
}

#[tokio::test]
async fn selection_accepts_one_proposal_and_opens_escrow() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let winner = Caller::seller(UserId::new());
    let loser = Caller::seller(UserId::new());
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let accepted = h
        .market
        .proposals()
        .create(&winner, bid(request.id, 180_000))
        .await
        .unwrap();
    let sibling = h
        .market
        .proposals()
        .create(&loser, bid(request.id, 170_000))
        .await
        .unwrap();

    let outsider = Caller::buyer(UserId::new());
    let err = h
        .market
        .selection()
        .select(&outsider, request.id, accepted.id)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Forbidden(_)));

    let selection = h
        .market
        .selection()
        .select(&buyer, request.id, accepted.id)
        .await
        .unwrap();
    assert_eq!(selection.request.status, RequestStatus::InProgress);
    assert_eq!(selection.request.selected_proposal_id, Some(accepted.id));
    assert_eq!(selection.proposal.status, ProposalStatus::Accepted);
    assert!(selection.proposal.selected_at.is_some());
    assert_eq!(selection.escrow.amount, 180_000);
    assert_eq!(selection.escrow.status, EscrowStatus::Pending);

    // Siblings stay PENDING in data but can no longer change.
    let untouched = h.market.proposals().get(sibling.id).await.unwrap();
    assert_eq!(untouched.status, ProposalStatus::Pending);
    let err = h
        .market
        .proposals()
        .update(
            sibling.id,
            &loser,
            ProposalPatch {
                price: Some(160_000),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict(&ConflictKind::RequestNotOpen));

    let err = h
        .market
        .selection()
        .select(&buyer, request.id, sibling.id)
        .await
        .unwrap_err();
    assert!(err.is_conflict(&ConflictKind::RequestNotOpen));

    let kinds: Vec<&str> = h.events.events().iter().map(NotificationEvent::kind).collect();
    assert_eq!(
        kinds,
        ["proposal_submitted", "proposal_submitted", "proposal_selected"]
    );
}

#[tokio::test]
async fn escrow_lifecycle_drives_orders_and_request() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let seller = Caller::seller(UserId::new());
    let system = Caller::system();
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let proposal = h
        .market
        .proposals()
        .create(&seller, bid(request.id, 200_000))
        .await
        .unwrap();
    let selection = h
        .market
        .selection()
        .select(&buyer, request.id, proposal.id)
        .await
        .unwrap();

    let err = h
        .market
        .payments()
        .escrow_funded(&buyer, selection.escrow.id, h.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Forbidden(_)));

    let (funded, order) = h
        .market
        .payments()
        .escrow_funded(&system, selection.escrow.id, datetime!(2026-01-16 10:00 UTC))
        .await
        .unwrap();
    assert_eq!(funded.status, EscrowStatus::Funded);
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.platform_fee, 30_000);

    let released = h
        .market
        .payments()
        .escrow_released(&system, selection.escrow.id)
        .await
        .unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    let completed = h.market.requests().get(request.id).await.unwrap();
    assert_eq!(completed.status, RequestStatus::Completed);
    assert_eq!(completed.selected_proposal_id, Some(proposal.id));

    let err = h
        .market
        .payments()
        .escrow_refunded(&system, selection.escrow.id)
        .await
        .unwrap_err();
    assert!(err.is_conflict(&ConflictKind::EscrowTerminal));
}

#[tokio::test]
async fn refund_takes_orders_out_of_settlement() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let system = Caller::system();
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let proposal = h
        .market
        .proposals()
        .create(&Caller::seller(UserId::new()), bid(request.id, 250_000))
        .await
        .unwrap();
    let escrow = h
        .market
        .selection()
        .select(&buyer, request.id, proposal.id)
        .await
        .unwrap()
        .escrow;
    let (_, order) = h
        .market
        .payments()
        .escrow_funded(&system, escrow.id, datetime!(2026-01-16 10:00 UTC))
        .await
        .unwrap();

    let refunded = h
        .market
        .payments()
        .escrow_refunded(&system, escrow.id)
        .await
        .unwrap();
    assert_eq!(refunded.status, EscrowStatus::Refunded);
    let stored = h.market.storage().get_order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Refunded);

    let err = h
        .market
        .payments()
        .escrow_funded(&system, escrow.id, datetime!(2026-01-17 10:00 UTC))
        .await
        .unwrap_err();
    assert!(err.is_conflict(&ConflictKind::EscrowTerminal));
}

#[tokio::test]
async fn cancelling_in_progress_request_clears_selection() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let proposal = h
        .market
        .proposals()
        .create(&Caller::seller(UserId::new()), bid(request.id, 200_000))
        .await
        .unwrap();
    h.market
        .selection()
        .select(&buyer, request.id, proposal.id)
        .await
        .unwrap();

    let cancelled = h.market.requests().cancel(request.id, &buyer).await.unwrap();
    assert_eq!(cancelled.status, RequestStatus::Cancelled);
    assert_eq!(cancelled.selected_proposal_id, None);
}

#[tokio::test]
async fn request_listing_filters_and_pages() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    for _ in 0..3 {
        h.market.requests().create(&buyer, new_request()).await.unwrap();
        h.clock.advance(time::Duration::minutes(1));
    }
    let other = h
        .market
        .requests()
        .create(&Caller::buyer(UserId::new()), new_request())
        .await
        .unwrap();
    h.market
        .requests()
        .cancel(other.id, &Caller::admin(UserId::new()))
        .await
        .unwrap();

    let open = RequestFilter {
        status: Some(RequestStatus::Open),
        ..Default::default()
    };
    let page = h
        .market
        .requests()
        .list(&open, PageRequest { offset: 0, limit: 2 })
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert!(page.has_more());
    assert!(page.items[0].created_at >= page.items[1].created_at);
}

#[tokio::test]
async fn verification_review_raises_seller_level() {
    let h = harness();
    let seller = Caller::seller(UserId::new());
    let verifier = Caller::verifier(UserId::new());
    let product = ProductId::new();
    let engine = h.market.verification();

    let job = engine.request_verification(&seller, product, 2).await.unwrap();
    assert_eq!(job.status, VerificationStatus::Pending);
    assert_eq!((job.fee, job.verifier_share, job.platform_share), (150, 105, 45));
    assert_eq!(engine.list_open_jobs(Some(2)).await.unwrap().len(), 1);
    assert!(engine.list_open_jobs(Some(3)).await.unwrap().is_empty());

    let own = Caller::verifier(seller.id);
    assert!(matches!(
        engine.claim(&own, job.id).await.unwrap_err(),
        MarketError::Forbidden(_)
    ));

    engine.claim(&verifier, job.id).await.unwrap();
    h.clock.advance(time::Duration::hours(6));
    let reviewed = engine
        .submit_review(
            &verifier,
            job.id,
            Review {
                approved: true,
                score: 88,
                comments: Some("Clean install, good docs".into()),
                badges: vec!["documented".into()],
                improvements: vec![],
            },
        )
        .await
        .unwrap();
    assert_eq!(reviewed.status, VerificationStatus::Approved);
    assert_eq!(reviewed.score, Some(88));
    assert_eq!(reviewed.turnaround(), Some(time::Duration::hours(6)));

    let profile = h
        .market
        .storage()
        .get_seller(seller.id)
        .await
        .unwrap()
        .expect("profile created on approval");
    assert_eq!(profile.verification_level, 2);

    let stats = engine.verifier_stats(verifier.id).await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.approved, 1);
    assert_eq!(stats.average_turnaround, Some(time::Duration::hours(6)));

    let kinds: Vec<&str> = h.events.events().iter().map(NotificationEvent::kind).collect();
    assert_eq!(kinds, ["verification_assigned", "verification_completed"]);
}

#[tokio::test]
async fn level_zero_verification_is_automatic_and_free() {
    let h = harness();
    let seller = Caller::seller(UserId::new());
    let v = h
        .market
        .verification()
        .request_verification(&seller, ProductId::new(), 0)
        .await
        .unwrap();
    assert_eq!(v.status, VerificationStatus::Approved);
    assert_eq!(v.fee, 0);
    assert!(v.verifier_id.is_none());

    let err = h
        .market
        .verification()
        .request_verification(&seller, ProductId::new(), 4)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Validation(_)));
}

#[tokio::test]
async fn review_checks_score_and_verifier() {
    let h = harness();
    let seller = Caller::seller(UserId::new());
    let verifier = Caller::verifier(UserId::new());
    let engine = h.market.verification();
    let job = engine
        .request_verification(&seller, ProductId::new(), 1)
        .await
        .unwrap();
    engine.claim(&verifier, job.id).await.unwrap();
    engine.begin(&verifier, job.id).await.unwrap();

    let stranger = Caller::verifier(UserId::new());
    let err = engine
        .submit_review(&stranger, job.id, Review { score: 50, ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Forbidden(_)));

    let err = engine
        .submit_review(&verifier, job.id, Review { score: 101, ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Validation(_)));

    let rejected = engine
        .submit_review(&verifier, job.id, Review { score: 30, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(rejected.status, VerificationStatus::Rejected);

    let err = engine.cancel(&seller, job.id).await.unwrap_err();
    assert!(matches!(
        err,
        MarketError::Conflict(ConflictKind::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn buyer_rejects_a_pending_proposal() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let seller_id = UserId::new();
    let seller = Caller::seller(seller_id);
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let proposal = h
        .market
        .proposals()
        .create(&seller, bid(request.id, 180_000))
        .await
        .unwrap();

    for outsider in [seller, Caller::buyer(UserId::new())] {
        let err = h
            .market
            .proposals()
            .reject(proposal.id, &outsider)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Forbidden(_)));
    }

    let rejected = h.market.proposals().reject(proposal.id, &buyer).await.unwrap();
    assert_eq!(rejected.status, ProposalStatus::Rejected);
    assert_eq!(rejected.version, proposal.version + 1);

    let err = h
        .market
        .proposals()
        .reject(proposal.id, &buyer)
        .await
        .unwrap_err();
    assert!(err.is_conflict(&ConflictKind::ProposalNotPending));

    let mine = h.market.proposals().list_by_seller(seller_id).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].status, ProposalStatus::Rejected);
}

#[tokio::test]
async fn seller_dashboard_lists_bids_across_requests() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let seller_id = UserId::new();
    let seller = Caller::seller(seller_id);
    let first = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let second = h.market.requests().create(&buyer, new_request()).await.unwrap();
    h.market
        .proposals()
        .create(&seller, bid(first.id, 120_000))
        .await
        .unwrap();
    h.market
        .proposals()
        .create(&seller, bid(second.id, 240_000))
        .await
        .unwrap();
    h.market
        .proposals()
        .create(&Caller::seller(UserId::new()), bid(first.id, 130_000))
        .await
        .unwrap();

    let mine = h.market.proposals().list_by_seller(seller_id).await.unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|p| p.seller_id == seller_id));
    let mut requests: Vec<_> = mine.iter().map(|p| p.request_id).collect();
    requests.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(requests, expected);
    assert!(h
        .market
        .proposals()
        .list_by_seller(UserId::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn platform_status_changes_follow_legal_edges() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let requests = h.market.requests();

    let err = requests
        .transition_status(&buyer, request.id, RequestStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Forbidden(_)));

    let err = requests
        .transition_status(&Caller::system(), request.id, RequestStatus::InProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Validation(_)));

    let err = requests
        .transition_status(&Caller::system(), request.id, RequestStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MarketError::Conflict(ConflictKind::InvalidTransition { entity: "request", .. })
    ));
    assert_eq!(requests.get(request.id).await.unwrap().status, RequestStatus::Open);

    let cancelled = requests
        .transition_status(&Caller::admin(UserId::new()), request.id, RequestStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.status, RequestStatus::Cancelled);
    assert_eq!(cancelled.updated_at, h.clock.now());
}

#[tokio::test]
async fn platform_completes_an_in_progress_request() {
    let h = harness();
    let buyer = Caller::buyer(UserId::new());
    let request = h.market.requests().create(&buyer, new_request()).await.unwrap();
    let proposal = h
        .market
        .proposals()
        .create(&Caller::seller(UserId::new()), bid(request.id, 200_000))
        .await
        .unwrap();
    h.market
        .selection()
        .select(&buyer, request.id, proposal.id)
        .await
        .unwrap();

    let done = h
        .market
        .requests()
        .transition_status(&Caller::system(), request.id, RequestStatus::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(done.selected_proposal_id, Some(proposal.id));
}
