//! PostgreSQL store tests.
//!
//! Requires a reachable database in `DATABASE_URL`; the schema is applied on
//! connect. Each test works in its own queue and dependency so runs can share
//! a database.
//! Run with: `cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use conduit::persistence::{connect, ensure_schema, PostgresBreakerStore, PostgresQueueStore};
use conduit::*;
use conduit_testkit::ManualClock;
use serde_json::json;

type PgManager = QueueManager<PostgresQueueStore, PostgresBreakerStore>;

struct Fixture {
    manager: Arc<PgManager>,
    clock: ManualClock,
    queue: String,
    dependency: String,
}

impl Fixture {
    fn request(&self, order_id: u64) -> EnqueueRequest {
        EnqueueRequest::new(self.queue.clone(), json!({ "order_id": order_id }))
            .with_dependency(self.dependency.clone())
    }
}

async fn fixture() -> Fixture {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let config = PersistenceConfig {
        connection_string: url,
        ..PersistenceConfig::default()
    };
    let pool = connect(&config).await.expect("connect");
    ensure_schema(&pool).await.expect("ensure_schema");

    // postgres keeps microseconds
    let clock = ManualClock::new(Utc::now().trunc_subsecs(6));
    let suffix = ItemId::new().to_string().replace('-', "");
    let retry = RetryPolicy {
        jitter_ratio: 0.0,
        ..RetryPolicy::default()
    };
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        Arc::new(PostgresBreakerStore::new(pool.clone())),
        BreakerConfig::default(),
    ));
    let manager = QueueManager::new(
        Arc::new(PostgresQueueStore::new(pool)),
        breakers,
        retry,
        QueueConfig::default(),
        chrono::Duration::seconds(30),
        Arc::new(clock.clone()),
        Arc::new(InProcEventBus::default()),
    );

    Fixture {
        manager: Arc::new(manager),
        clock,
        queue: format!("pg_sync_{suffix}"),
        dependency: format!("pg_api_{suffix}"),
    }
}

#[tokio::test]
#[ignore]
async fn test_claim_order_and_settlement() {
    let fx = fixture().await;
    let low = fx
        .manager
        .enqueue(fx.request(1).with_priority(5))
        .await
        .unwrap();
    let first = fx.manager.enqueue(fx.request(2)).await.unwrap();
    let second = fx.manager.enqueue(fx.request(3)).await.unwrap();

    let mut claimed = Vec::new();
    while let Some(lease) = fx.manager.claim_next(&fx.queue, "pg-worker").await.unwrap() {
        claimed.push(lease.item.id);
        let lease = fx.manager.start(lease).await.unwrap().unwrap();
        assert!(fx.manager.complete(&lease).await.unwrap());
        // a second settlement on the same lease is a no-op
        assert!(!fx.manager.complete(&lease).await.unwrap());
    }
    assert_eq!(claimed, vec![first.id, second.id, low.id]);

    let stats = fx.manager.stats(&fx.queue).await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 0);

    fx.clock.advance_secs(120);
    assert_eq!(
        fx.manager
            .cleanup(&fx.queue, chrono::Duration::seconds(60))
            .await
            .unwrap(),
        3
    );
}

#[tokio::test]
#[ignore]
async fn test_transient_failure_reschedules() {
    let fx = fixture().await;
    let item = fx.manager.enqueue(fx.request(1)).await.unwrap();

    let lease = fx.manager.claim_next(&fx.queue, "pg-worker").await.unwrap().unwrap();
    let lease = fx.manager.start(lease).await.unwrap().unwrap();
    fx.manager
        .fail(&lease, FailureClass::Transient, "HTTP 503")
        .await
        .unwrap();

    let stored = fx.manager.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Pending);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.scheduled_at, fx.clock.now() + chrono::Duration::seconds(60));
    assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));
    assert!(fx.manager.claim_next(&fx.queue, "pg-worker").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_claims_have_one_winner() {
    let fx = fixture().await;
    fx.manager.enqueue(fx.request(1)).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|n| {
            let manager = Arc::clone(&fx.manager);
            let queue = fx.queue.clone();
            tokio::spawn(async move { manager.claim_next(&queue, &format!("pg-{n}")).await })
        })
        .collect();

    let winners = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(Some(_)))))
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore]
async fn test_breaker_opens_and_blocks_claims() {
    let fx = fixture().await;
    let breakers = fx.manager.breakers();
    for _ in 0..5 {
        breakers
            .record_failure(&fx.dependency, fx.clock.now())
            .await
            .unwrap();
    }
    let snapshot = breakers.snapshot(&fx.dependency, fx.clock.now()).await.unwrap();
    assert_eq!(snapshot.state, BreakerState::Open);

    fx.manager.enqueue(fx.request(1)).await.unwrap();
    assert!(fx.manager.claim_next(&fx.queue, "pg-worker").await.unwrap().is_none());

    fx.clock.advance_secs(60);
    let lease = fx.manager.claim_next(&fx.queue, "pg-worker").await.unwrap().unwrap();
    assert!(lease.trial);

    let snapshot = breakers.reset(&fx.dependency, fx.clock.now()).await.unwrap();
    assert_eq!(snapshot.state, BreakerState::Closed);
}
