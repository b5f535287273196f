//! Queue manager tests over the in-memory stores.
//!
//! Covers claim ordering, breaker gating, retry and dead-letter
//! settlement, lease reclaim, requeue, cleanup and statistics.

use std::sync::Arc;

use chrono::Duration;
use conduit::*;
use conduit_testkit::{
    seed, Harness, OrderSync, KLAVIYO_API, KLAVIYO_SYNC, TIXR_PULL,
};
use serde_json::json;

const WORKER: &str = "klaviyo_sync-test-w0";

async fn claim(manager: &conduit_testkit::TestManager) -> ItemLease {
    manager
        .claim_next(KLAVIYO_SYNC, WORKER)
        .await
        .unwrap()
        .expect("an item should be claimable")
}

#[tokio::test]
async fn test_claim_respects_priority_then_insertion_order() {
    let harness = Harness::new();
    let manager = harness.manager();

    let first = manager
        .enqueue(OrderSync::new(1).request().with_priority(1))
        .await
        .unwrap();
    let low = manager
        .enqueue(OrderSync::new(2).request().with_priority(5))
        .await
        .unwrap();
    let second = manager
        .enqueue(OrderSync::new(3).request().with_priority(1))
        .await
        .unwrap();

    let order: Vec<ItemId> = vec![
        claim(&manager).await.item.id,
        claim(&manager).await.item.id,
        claim(&manager).await.item.id,
    ];
    assert_eq!(order, vec![first.id, second.id, low.id]);
    assert!(manager
        .claim_next(KLAVIYO_SYNC, WORKER)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_claim_skips_items_scheduled_in_future() {
    let harness = Harness::new();
    let manager = harness.manager();
    let later = harness.clock.now() + Duration::minutes(5);

    manager
        .enqueue(OrderSync::new(1).request().with_scheduled_at(later))
        .await
        .unwrap();

    assert!(manager.claim_next(KLAVIYO_SYNC, WORKER).await.unwrap().is_none());

    harness.clock.advance(Duration::minutes(5));
    let lease = claim(&manager).await;
    assert_eq!(lease.item.status, ItemStatus::Claimed);
    assert_eq!(lease.item.claimed_at, Some(harness.clock.now()));
    assert_eq!(lease.expires_at, harness.clock.now() + Duration::seconds(30));
}

#[tokio::test]
async fn test_claim_on_empty_queue_is_none() {
    let harness = Harness::new();
    let manager = harness.manager();
    assert!(manager.claim_next(TIXR_PULL, WORKER).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    let harness = Harness::new();
    let manager = Arc::new(harness.manager());
    let item = manager.enqueue(OrderSync::new(7).request()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            manager
                .claim_next(KLAVIYO_SYNC, &format!("racer-{i}"))
                .await
                .unwrap()
        }));
    }

    let winners: Vec<ItemLease> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap())
        .collect();

    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].item.id, item.id);
    let stored = manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.lease_owner.as_deref(), Some(winners[0].worker_id.as_str()));
}

#[tokio::test]
async fn test_open_breaker_excludes_its_dependency() {
    let harness = Harness::new();
    let manager = harness.manager();
    let now = harness.clock.now();

    for _ in 0..5 {
        manager
            .breakers()
            .record_failure(KLAVIYO_API, now)
            .await
            .unwrap();
    }

    manager
        .enqueue(OrderSync::new(1).request().with_priority(0))
        .await
        .unwrap();
    let fallback = manager
        .enqueue(
            OrderSync::new(2)
                .request()
                .with_priority(9)
                .with_dependency("klaviyo_bulk_api"),
        )
        .await
        .unwrap();

    let lease = claim(&manager).await;
    assert_eq!(lease.item.id, fallback.id);
    assert!(!lease.trial);
    assert!(manager.claim_next(KLAVIYO_SYNC, WORKER).await.unwrap().is_none());

    let stats = manager.stats(KLAVIYO_SYNC).await.unwrap();
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_half_open_admits_a_single_trial() {
    let harness = Harness::new();
    let manager = harness.manager();
    let now = harness.clock.now();

    for _ in 0..5 {
        manager
            .breakers()
            .record_failure(KLAVIYO_API, now)
            .await
            .unwrap();
    }
    for order in 1..=3 {
        manager.enqueue(OrderSync::new(order).request()).await.unwrap();
    }

    harness.clock.advance_secs(60);
    let trial = claim(&manager).await;
    assert!(trial.trial);
    assert!(manager.claim_next(KLAVIYO_SYNC, "other").await.unwrap().is_none());

    let trial = manager.start(trial).await.unwrap().unwrap();
    assert!(manager.complete(&trial).await.unwrap());

    let snapshot = manager
        .breakers()
        .snapshot(KLAVIYO_API, harness.clock.now())
        .await
        .unwrap();
    assert_eq!(snapshot.state, BreakerState::Closed);
    assert_eq!(snapshot.failure_count, 0);

    assert!(!claim(&manager).await.trial);
    assert!(!claim(&manager).await.trial);
}

async fn trip_breaker(harness: &Harness, manager: &conduit_testkit::TestManager) {
    for _ in 0..5 {
        manager
            .breakers()
            .record_failure(KLAVIYO_API, harness.clock.now())
            .await
            .unwrap();
    }
    harness.clock.advance_secs(60);
}

#[tokio::test]
async fn test_heartbeating_trial_outlives_reservation_window() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.enqueue(OrderSync::new(1).request()).await.unwrap();
    let waiting = manager.enqueue(OrderSync::new(2).request()).await.unwrap();
    trip_breaker(&harness, &manager).await;

    let trial = manager.start(claim(&manager).await).await.unwrap().unwrap();
    assert!(trial.trial);

    // well past the 300s reservation window, kept alive by heartbeats
    for _ in 0..11 {
        harness.clock.advance_secs(28);
        assert!(manager.renew(&trial).await.unwrap().is_some());
    }
    assert!(manager.claim_next(KLAVIYO_SYNC, "other").await.unwrap().is_none());
    let snapshot = manager
        .breakers()
        .snapshot(KLAVIYO_API, harness.clock.now())
        .await
        .unwrap();
    assert_eq!(snapshot.state, BreakerState::HalfOpen);

    assert!(manager.complete(&trial).await.unwrap());
    let next = manager.claim_next(KLAVIYO_SYNC, "other").await.unwrap().unwrap();
    assert_eq!(next.item.id, waiting.id);
    assert!(!next.trial);
}

#[tokio::test]
async fn test_abandoned_trial_frees_breaker_when_lease_lapses() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.enqueue(OrderSync::new(1).request()).await.unwrap();
    let waiting = manager.enqueue(OrderSync::new(2).request()).await.unwrap();
    trip_breaker(&harness, &manager).await;

    let trial = manager.start(claim(&manager).await).await.unwrap().unwrap();
    assert!(trial.trial);
    harness.clock.advance_secs(10);
    assert!(manager.claim_next(KLAVIYO_SYNC, "other").await.unwrap().is_none());

    // the worker died: no heartbeat, lease lapses at +30s
    harness.clock.advance_secs(21);
    assert_eq!(manager.reclaim_expired().await.unwrap(), 1);

    let next = manager.claim_next(KLAVIYO_SYNC, "other").await.unwrap().unwrap();
    assert!(next.trial);
    assert_eq!(next.item.id, waiting.id);
}

#[tokio::test]
async fn test_transient_failure_schedules_retry_with_backoff() {
    let harness = Harness::new();
    let manager = harness.manager();
    let item = manager.enqueue(OrderSync::new(1).request()).await.unwrap();

    let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
    assert_eq!(lease.item.status, ItemStatus::Running);
    assert_eq!(lease.item.attempt_count, 1);

    let settlement = manager
        .fail(&lease, FailureClass::Transient, "HTTP 503")
        .await
        .unwrap()
        .unwrap();
    let retry_at = harness.clock.now() + Duration::seconds(60);
    assert_eq!(
        settlement,
        Settlement::Retry {
            scheduled_at: retry_at,
            error: "HTTP 503".into(),
        }
    );

    let stored = manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Pending);
    assert_eq!(stored.scheduled_at, retry_at);
    assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));
    assert!(stored.lease_id.is_none());

    assert!(manager.claim_next(KLAVIYO_SYNC, WORKER).await.unwrap().is_none());
    harness.clock.advance_secs(60);
    assert_eq!(claim(&manager).await.item.id, item.id);
}

#[tokio::test]
async fn test_exhausted_attempts_dead_letter() {
    let harness = Harness::new();
    let manager = harness.manager();
    let item = manager.enqueue(OrderSync::new(1).request()).await.unwrap();
    assert_eq!(item.max_attempts, 3);

    for _ in 0..3 {
        let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
        manager
            .fail(&lease, FailureClass::Transient, "timeout")
            .await
            .unwrap();
        harness.clock.advance(Duration::hours(1));
    }

    let stored = manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Dead);
    assert_eq!(stored.attempt_count, 3);
    assert!(stored.completed_at.is_some());
    assert!(manager.claim_next(KLAVIYO_SYNC, WORKER).await.unwrap().is_none());
}

#[tokio::test]
async fn test_permanent_failure_is_never_retried() {
    let harness = Harness::new();
    let manager = harness.manager();
    let item = manager
        .enqueue(OrderSync::new(1).request().with_max_attempts(5))
        .await
        .unwrap();

    let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
    let settlement = manager
        .fail(&lease, FailureClass::Permanent, "invalid email")
        .await
        .unwrap();
    assert!(matches!(settlement, Some(Settlement::Dead { .. })));

    let stored = manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Dead);
    assert_eq!(stored.attempt_count, 1);
}

#[tokio::test]
async fn test_settlement_after_lease_loss_is_discarded() {
    let harness = Harness::new();
    let manager = harness.manager();
    let item = manager.enqueue(OrderSync::new(1).request()).await.unwrap();

    let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
    harness.clock.advance_secs(31);
    assert_eq!(manager.reclaim_expired().await.unwrap(), 1);

    assert!(!manager.complete(&lease).await.unwrap());
    assert!(manager.renew(&lease).await.unwrap().is_none());

    let stored = manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Pending);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
}

#[tokio::test]
async fn test_reclaim_charges_an_attempt_for_unstarted_claims() {
    let harness = Harness::new();
    let manager = harness.manager();
    let item = manager
        .enqueue(OrderSync::new(1).request().with_max_attempts(1))
        .await
        .unwrap();

    let lease = claim(&manager).await;
    harness.clock.advance_secs(31);
    assert!(manager.start(lease).await.unwrap().is_none());
    assert_eq!(manager.reclaim_expired().await.unwrap(), 1);

    let stored = manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Dead);
    assert_eq!(stored.attempt_count, 1);
}

#[tokio::test]
async fn test_renew_extends_lease() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.enqueue(OrderSync::new(1).request()).await.unwrap();

    let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
    harness.clock.advance_secs(20);
    let renewed = manager.renew(&lease).await.unwrap().unwrap();
    assert_eq!(renewed, harness.clock.now() + Duration::seconds(30));

    harness.clock.advance_secs(20);
    assert_eq!(manager.reclaim_expired().await.unwrap(), 0);
    assert!(manager.complete(&lease).await.unwrap());
}

#[tokio::test]
async fn test_reject_then_requeue() {
    let harness = Harness::new();
    let manager = harness.manager();
    let item = manager
        .enqueue(EnqueueRequest::new("mailchimp_sync", json!({"order_id": 1})))
        .await
        .unwrap();

    let lease = manager
        .claim_next("mailchimp_sync", WORKER)
        .await
        .unwrap()
        .unwrap();
    assert!(manager.reject(&lease, "no handler").await.unwrap());

    let stored = manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Failed);
    assert_eq!(stored.attempt_count, 0);

    assert_eq!(
        manager
            .requeue("mailchimp_sync", Duration::zero(), false)
            .await
            .unwrap(),
        1
    );
    let stored = manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Pending);
    assert!(stored.completed_at.is_none());
}

#[tokio::test]
async fn test_requeue_dead_needs_reset_when_exhausted() {
    let harness = Harness::new();
    let manager = harness.manager();
    let dead = manager
        .enqueue(OrderSync::new(1).request().with_max_attempts(1))
        .await
        .unwrap();
    let running = manager.enqueue(OrderSync::new(2).request()).await.unwrap();

    let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
    manager
        .fail(&lease, FailureClass::Transient, "HTTP 500")
        .await
        .unwrap();
    let in_flight = manager.start(claim(&manager).await).await.unwrap().unwrap();
    assert_eq!(in_flight.item.id, running.id);

    harness.clock.advance(Duration::hours(2));
    assert_eq!(
        manager
            .requeue(KLAVIYO_SYNC, Duration::hours(1), false)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        manager
            .requeue(KLAVIYO_SYNC, Duration::hours(3), true)
            .await
            .unwrap(),
        0
    );
    assert!(manager
        .requeue_item(dead.id, Duration::hours(1), true)
        .await
        .unwrap());

    let stored = manager.get(dead.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Pending);
    assert_eq!(stored.attempt_count, 0);

    let untouched = manager.get(running.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, ItemStatus::Running);
}

#[tokio::test]
async fn test_cleanup_purges_only_old_finished_items() {
    let harness = Harness::new();
    let manager = harness.manager();
    let done = manager.enqueue(OrderSync::new(1).request()).await.unwrap();
    let pending = manager.enqueue(OrderSync::new(2).request()).await.unwrap();

    let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
    assert_eq!(lease.item.id, done.id);
    manager.complete(&lease).await.unwrap();

    assert_eq!(manager.cleanup(KLAVIYO_SYNC, Duration::hours(1)).await.unwrap(), 0);

    harness.clock.advance(Duration::hours(2));
    assert_eq!(manager.cleanup(KLAVIYO_SYNC, Duration::hours(1)).await.unwrap(), 1);
    assert!(manager.get(done.id).await.unwrap().is_none());
    assert!(manager.get(pending.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_stats_counts_and_success_rate() {
    let harness = Harness::new();
    let manager = harness.manager();
    for order in 1..=4 {
        manager.enqueue(OrderSync::new(order).request()).await.unwrap();
    }

    harness.clock.advance_secs(2);
    for _ in 0..3 {
        let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
        manager.complete(&lease).await.unwrap();
    }
    let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
    manager
        .fail(&lease, FailureClass::Permanent, "bad payload")
        .await
        .unwrap();

    let stats = manager.stats(KLAVIYO_SYNC).await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.avg_duration_ms, Some(2_000.0));
    assert_eq!(stats.success_rate, 75.0);

    let all = manager.all_stats().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].queue_name, KLAVIYO_SYNC);
}

#[tokio::test]
async fn test_enqueue_many_is_all_or_nothing() {
    let harness = Harness::new();
    let manager = harness.manager();

    let err = manager
        .enqueue_many(vec![
            OrderSync::new(1).request(),
            EnqueueRequest::new(KLAVIYO_SYNC, serde_json::Value::Null),
        ])
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidEnqueue(_))
    ));
    assert!(harness.queue.is_empty());

    let items = manager
        .enqueue_many((1..=3).map(|n| OrderSync::new(n).request()).collect())
        .await
        .unwrap();
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|item| item.dependency == KLAVIYO_API));
}

#[tokio::test]
async fn test_enqueue_many_rejects_oversized_batch() {
    let harness = Harness::new().with_config(|config| config.queue.batch_size = 2);
    let manager = harness.manager();

    let err = manager
        .enqueue_many((1..=3).map(|n| OrderSync::new(n).request()).collect())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds the limit"));
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let harness = Harness::new();
    let manager = harness.manager();
    let mut events = harness.events.subscribe();

    let item = manager.enqueue(OrderSync::new(1).request()).await.unwrap();
    let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
    manager.complete(&lease).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.meta.item_id, item.id);
        kinds.push(event.payload);
    }
    assert!(matches!(kinds[0], ItemEventPayload::Enqueued { priority: 0, .. }));
    assert!(matches!(kinds[1], ItemEventPayload::Claimed { .. }));
    assert!(matches!(
        kinds[2],
        ItemEventPayload::Completed { attempt_count: 1 }
    ));
}

#[tokio::test]
async fn test_seeded_items_share_the_store() {
    let harness = Harness::new();
    let manager = harness.manager();
    let item = seed(&*harness.queue, OrderSync::new(1).request(), harness.clock.now())
        .await
        .unwrap();
    assert_eq!(claim(&manager).await.item.id, item.id);
}

#[tokio::test]
async fn test_klaviyo_outage_opens_breaker_then_dispatches_one_trial() {
    let harness = Harness::new();
    let manager = harness.manager();

    for order in 1..=5 {
        manager.enqueue(OrderSync::new(order).request()).await.unwrap();
    }
    for _ in 0..5 {
        let lease = manager.start(claim(&manager).await).await.unwrap().unwrap();
        manager
            .fail(&lease, FailureClass::Transient, "HTTP 503")
            .await
            .unwrap();
    }
    let opened_at = harness.clock.now();

    let snapshot = manager
        .breakers()
        .snapshot(KLAVIYO_API, opened_at)
        .await
        .unwrap();
    assert_eq!(snapshot.state, BreakerState::Open);
    assert_eq!(snapshot.next_attempt_at, Some(opened_at + Duration::seconds(60)));

    let sixth = manager.enqueue(OrderSync::new(6).request().with_priority(-1)).await.unwrap();
    harness.clock.advance_secs(59);
    assert!(manager.claim_next(KLAVIYO_SYNC, WORKER).await.unwrap().is_none());

    harness.clock.advance_secs(1);
    let trial = claim(&manager).await;
    assert!(trial.trial);
    assert_eq!(trial.item.id, sixth.id);
    assert!(manager.claim_next(KLAVIYO_SYNC, "other").await.unwrap().is_none());
}
