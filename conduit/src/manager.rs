//! Queue manager: the single entry point workers and operators use to move
//! items through their lifecycle.
//!
//! The manager owns no state of its own. Every decision reads the store and
//! the breaker registry, and every write is a conditional update there.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn, Instrument};

use crate::breaker::{Admission, BreakerStore, CircuitBreakerRegistry};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::EngineError;
use crate::events::{ItemEvent, ItemEventPayload, ItemEventPublisher};
use crate::item::{EnqueueRequest, ItemId, QueueItem};
use crate::lease::{process_expired_lease, ClaimRequest, ExpiredLeaseOutcome, ItemLease, LeaseRenewal};
use crate::queue::{LeaseExpiryScanner, QueueStats, QueueStore, RequeueFilter, Settlement};
use crate::retry::{FailureClass, RetryDecision, RetryPolicy};
use crate::telemetry;

/// Coordinates the job record store, breaker registry and retry policy.
pub struct QueueManager<Q, B> {
    store: Arc<Q>,
    breakers: Arc<CircuitBreakerRegistry<B>>,
    retry: RetryPolicy,
    queue_config: QueueConfig,
    lease_ttl: Duration,
    clock: Arc<dyn Clock>,
    events: Arc<dyn ItemEventPublisher>,
}

impl<Q, B> std::fmt::Debug for QueueManager<Q, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("retry", &self.retry)
            .field("queue_config", &self.queue_config)
            .field("lease_ttl_secs", &self.lease_ttl.num_seconds())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<Q, B> QueueManager<Q, B>
where
    Q: QueueStore + LeaseExpiryScanner + 'static,
    B: BreakerStore + 'static,
{
    pub fn new(
        store: Arc<Q>,
        breakers: Arc<CircuitBreakerRegistry<B>>,
        retry: RetryPolicy,
        queue_config: QueueConfig,
        lease_ttl: Duration,
        clock: Arc<dyn Clock>,
        events: Arc<dyn ItemEventPublisher>,
    ) -> Self {
        Self {
            store,
            breakers,
            retry,
            queue_config,
            lease_ttl,
            clock,
            events,
        }
    }

    pub fn store(&self) -> Arc<Q> {
        Arc::clone(&self.store)
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry<B>> {
        Arc::clone(&self.breakers)
    }

    pub fn events(&self) -> Arc<dyn ItemEventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Validate and store one item as pending.
    pub async fn enqueue(&self, request: EnqueueRequest) -> anyhow::Result<QueueItem> {
        let mut items = self.enqueue_many(vec![request]).await?;
        items
            .pop()
            .ok_or_else(|| anyhow::anyhow!("store returned no item for a single enqueue"))
    }

    /// Validate and store a batch; either every item is stored or none is.
    pub async fn enqueue_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> anyhow::Result<Vec<QueueItem>> {
        if requests.len() > self.queue_config.batch_size {
            return Err(EngineError::InvalidEnqueue(format!(
                "batch of {} exceeds the limit of {}",
                requests.len(),
                self.queue_config.batch_size
            ))
            .into());
        }

        let now = self.clock.now();
        let new_items = requests
            .into_iter()
            .map(|request| request.validate(&self.queue_config, now))
            .collect::<Result<Vec<_>, _>>()?;
        if new_items.is_empty() {
            return Ok(Vec::new());
        }

        let items = self.store.insert(new_items).await?;
        for item in &items {
            let span = telemetry::item_enqueue_span(&item.queue_name, item.correlation_id.as_str());
            let _enter = span.enter();
            telemetry::record_item_enqueued(&item.queue_name, item.id.to_string());
        }
        for item in &items {
            self.emit(
                item,
                now,
                ItemEventPayload::Enqueued {
                    priority: item.priority,
                    dependency: item.dependency.clone(),
                },
            )
            .await;
        }
        Ok(items)
    }

    /// Claim the next eligible item of `queue_name` for `worker_id`.
    ///
    /// Returns `None` when nothing is eligible: the queue is empty, every
    /// pending item is scheduled in the future, or every dependency with
    /// pending work is blocked by its breaker.
    pub async fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
    ) -> anyhow::Result<Option<ItemLease>> {
        let span = telemetry::item_claim_span(worker_id, queue_name);
        self.claim_next_inner(queue_name, worker_id)
            .instrument(span)
            .await
    }

    async fn claim_next_inner(
        &self,
        queue_name: &str,
        worker_id: &str,
    ) -> anyhow::Result<Option<ItemLease>> {
        let now = self.clock.now();
        let candidates = self.store.claimable_dependencies(queue_name, now).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut admitted = Vec::with_capacity(candidates.len());
        let mut trials = Vec::new();
        for dependency in candidates {
            match self.breakers.admit(&dependency, now).await {
                Ok(Admission::Allowed) => admitted.push(dependency),
                Ok(Admission::Trial) => {
                    debug!(dependency = %dependency, "half-open trial reserved");
                    trials.push(dependency.clone());
                    admitted.push(dependency);
                }
                Ok(Admission::Blocked { until }) => {
                    debug!(dependency = %dependency, ?until, "dependency blocked by breaker");
                }
                Err(e) => {
                    self.release_trials(&trials, None, now).await;
                    return Err(e);
                }
            }
        }
        if admitted.is_empty() {
            return Ok(None);
        }

        let request = ClaimRequest {
            queue_name: queue_name.to_string(),
            dependencies: admitted,
            worker_id: worker_id.to_string(),
            lease_ttl: self.lease_ttl,
            now,
        };
        let claimed = match self.store.claim_next(request).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.release_trials(&trials, None, now).await;
                return Err(e);
            }
        };

        let winner = claimed.as_ref().map(|lease| lease.item.dependency.clone());
        self.release_trials(&trials, winner.as_deref(), now).await;

        let Some(mut lease) = claimed else {
            return Ok(None);
        };
        lease.trial = winner.as_ref().is_some_and(|dep| trials.contains(dep));
        if lease.trial {
            self.hold_trial(&lease, lease.expires_at, now).await;
        }

        debug!(
            item_id = %lease.item.id,
            lease_id = %lease.lease_id,
            dependency = %lease.item.dependency,
            trial = lease.trial,
            "item claimed"
        );
        self.emit(
            &lease.item,
            now,
            ItemEventPayload::Claimed {
                lease_id: lease.lease_id,
                worker_id: lease.worker_id.clone(),
            },
        )
        .await;
        Ok(Some(lease))
    }

    /// Pin the trial reservation to the trial lease. A lapsed heartbeat then
    /// frees the breaker for the next trial together with the item.
    async fn hold_trial(&self, lease: &ItemLease, until: DateTime<Utc>, now: DateTime<Utc>) {
        let dependency = &lease.item.dependency;
        if let Err(e) = self.breakers.hold_trial(dependency, until, now).await {
            warn!(dependency = %dependency, error = %e, "failed to extend breaker trial");
        }
    }

    async fn release_trials(&self, trials: &[String], keep: Option<&str>, now: DateTime<Utc>) {
        for dependency in trials {
            if keep == Some(dependency.as_str()) {
                continue;
            }
            if let Err(e) = self.breakers.release_trial(dependency, now).await {
                warn!(dependency = %dependency, error = %e, "failed to release breaker trial");
            }
        }
    }

    /// Move a claimed item to running, counting the attempt.
    ///
    /// Returns `None` if the lease was lost before the item started.
    pub async fn start(&self, lease: ItemLease) -> anyhow::Result<Option<ItemLease>> {
        let now = self.clock.now();
        match self.store.mark_running(lease.lease_id, now).await? {
            Some(item) => Ok(Some(ItemLease { item, ..lease })),
            None => {
                warn!(item_id = %lease.item.id, lease_id = %lease.lease_id, "lease lost before start");
                if lease.trial {
                    self.release_trials(std::slice::from_ref(&lease.item.dependency), None, now)
                        .await;
                }
                Ok(None)
            }
        }
    }

    /// Heartbeat: push the lease expiry to now + TTL.
    pub async fn renew(&self, lease: &ItemLease) -> anyhow::Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        let span = telemetry::lease_renew_span(lease.lease_id.to_string(), lease.item.id.to_string());
        let renewed = self
            .store
            .renew(LeaseRenewal {
                lease_id: lease.lease_id,
                worker_id: lease.worker_id.clone(),
                extend_by: self.lease_ttl,
                now,
            })
            .instrument(span)
            .await?;

        if let Some(expires_at) = renewed {
            if lease.trial {
                self.hold_trial(lease, expires_at, now).await;
            }
            self.emit(
                &lease.item,
                now,
                ItemEventPayload::LeaseRenewed {
                    lease_id: lease.lease_id,
                    expires_at,
                },
            )
            .await;
        }
        Ok(renewed)
    }

    /// Settle a successful attempt and report success to the breaker.
    ///
    /// Returns false when the lease had already been lost.
    pub async fn complete(&self, lease: &ItemLease) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let applied = self.settle(lease, Settlement::Completed, now).await?;
        if let Err(e) = self.breakers.record_success(&lease.item.dependency, now).await {
            warn!(dependency = %lease.item.dependency, error = %e, "failed to record breaker success");
        }
        if applied {
            self.emit(
                &lease.item,
                now,
                ItemEventPayload::Completed {
                    attempt_count: lease.item.attempt_count,
                },
            )
            .await;
        }
        Ok(applied)
    }

    /// Settle a failed attempt through the retry policy and report the
    /// failure to the breaker.
    ///
    /// Returns the settlement written, or `None` when the lease was lost.
    pub async fn fail(
        &self,
        lease: &ItemLease,
        failure: FailureClass,
        error: impl Into<String>,
    ) -> anyhow::Result<Option<Settlement>> {
        let error = error.into();
        let now = self.clock.now();
        let item = &lease.item;
        let decision = self.retry.decide_with_rng(
            item.attempt_count,
            item.max_attempts,
            failure,
            now,
            &mut rand::thread_rng(),
        );
        let settlement = match decision {
            RetryDecision::RetryAt(scheduled_at) => Settlement::Retry {
                scheduled_at,
                error: error.clone(),
            },
            RetryDecision::Dead(reason) => {
                debug!(item_id = %item.id, ?reason, "no further attempts");
                Settlement::Dead {
                    error: error.clone(),
                }
            }
        };

        let applied = self.settle(lease, settlement.clone(), now).await?;
        if let Err(e) = self.breakers.record_failure(&item.dependency, now).await {
            warn!(dependency = %item.dependency, error = %e, "failed to record breaker failure");
        }
        if !applied {
            return Ok(None);
        }

        let payload = match &settlement {
            Settlement::Retry { scheduled_at, .. } => ItemEventPayload::RetryScheduled {
                attempt_count: item.attempt_count,
                scheduled_at: *scheduled_at,
                error,
            },
            _ => ItemEventPayload::DeadLettered {
                attempt_count: item.attempt_count,
                error,
            },
        };
        self.emit(item, now, payload).await;
        Ok(Some(settlement))
    }

    /// Mark an item `failed` because nothing can handle its queue.
    ///
    /// Not reported to the breaker; a trial reservation held by this lease
    /// is handed back.
    pub async fn reject(&self, lease: &ItemLease, error: impl Into<String>) -> anyhow::Result<bool> {
        let error = error.into();
        let now = self.clock.now();
        let applied = self
            .settle(lease, Settlement::Failed { error: error.clone() }, now)
            .await?;
        if lease.trial {
            self.release_trials(std::slice::from_ref(&lease.item.dependency), None, now)
                .await;
        }
        if applied {
            self.emit(&lease.item, now, ItemEventPayload::Failed { error })
                .await;
        }
        Ok(applied)
    }

    async fn settle(
        &self,
        lease: &ItemLease,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let item = &lease.item;
        let outcome = settlement.label();
        let span = telemetry::item_settle_span(item.id.to_string(), outcome);
        let applied = self
            .store
            .settle(lease.lease_id, settlement, now)
            .instrument(span)
            .await?;

        if applied {
            telemetry::record_item_settled(&item.queue_name, item.id.to_string(), outcome);
        } else {
            warn!(
                item_id = %item.id,
                lease_id = %lease.lease_id,
                outcome,
                "lease lost before settlement, outcome discarded"
            );
        }
        Ok(applied)
    }

    /// Requeue `failed`/`dead` items of a queue that finished at least
    /// `older_than` ago.
    pub async fn requeue(
        &self,
        queue_name: &str,
        older_than: Duration,
        reset_attempts: bool,
    ) -> anyhow::Result<u64> {
        let now = self.clock.now();
        let filter = RequeueFilter::queue(queue_name, now - older_than, reset_attempts);
        let count = self.store.requeue(filter, now).await?;
        info!(queue = queue_name, count, reset_attempts, "items requeued");
        Ok(count)
    }

    /// Requeue one `failed`/`dead` item. Anything else is left alone.
    pub async fn requeue_item(
        &self,
        item_id: ItemId,
        older_than: Duration,
        reset_attempts: bool,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let filter = RequeueFilter::item(item_id, now - older_than, reset_attempts);
        let requeued = self.store.requeue(filter, now).await? > 0;
        info!(item_id = %item_id, requeued, reset_attempts, "item requeue requested");
        Ok(requeued)
    }

    /// Purge `completed`/`dead` items that finished more than `older_than` ago.
    pub async fn cleanup(&self, queue_name: &str, older_than: Duration) -> anyhow::Result<u64> {
        let cutoff = self.clock.now() - older_than;
        let deleted = self.store.cleanup(queue_name, cutoff).await?;
        if deleted > 0 {
            info!(queue = queue_name, deleted, "old queue items cleaned up");
        }
        Ok(deleted)
    }

    pub async fn stats(&self, queue_name: &str) -> anyhow::Result<QueueStats> {
        self.store.stats(queue_name).await
    }

    pub async fn all_stats(&self) -> anyhow::Result<Vec<QueueStats>> {
        let mut all = Vec::new();
        for queue_name in self.store.queue_names().await? {
            all.push(self.store.stats(&queue_name).await?);
        }
        Ok(all)
    }

    pub async fn get(&self, item_id: ItemId) -> anyhow::Result<Option<QueueItem>> {
        self.store.get(item_id).await
    }

    /// Resolve every lease that expired without a heartbeat.
    ///
    /// Returns how many items were reclaimed.
    pub async fn reclaim_expired(&self) -> anyhow::Result<u64> {
        let now = self.clock.now();
        let expired = self.store.expired_leases(now).await?;
        let mut reclaimed = 0;

        for item in expired {
            let Some(lease_id) = item.lease_id else {
                continue;
            };
            let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
            let outcome = process_expired_lease(&item, now, &self.retry, jitter);
            let dead_lettered = matches!(outcome, ExpiredLeaseOutcome::DeadLettered { .. });

            match self.store.reclaim(item.id, lease_id, outcome, now).await {
                Ok(true) => {
                    reclaimed += 1;
                    telemetry::record_lease_expired(&item.queue_name, item.id.to_string());
                    self.emit(
                        &item,
                        now,
                        ItemEventPayload::LeaseExpired {
                            lease_id,
                            dead_lettered,
                        },
                    )
                    .await;
                }
                Ok(false) => {
                    debug!(item_id = %item.id, "expired lease settled concurrently");
                }
                Err(e) => {
                    error!(item_id = %item.id, error = %e, "failed to reclaim expired lease");
                }
            }
        }

        Ok(reclaimed)
    }

    async fn emit(&self, item: &QueueItem, now: DateTime<Utc>, payload: ItemEventPayload) {
        if let Err(e) = self.events.publish(ItemEvent::new(item, now, payload)).await {
            debug!(item_id = %item.id, error = %e, "failed to publish item event");
        }
    }
}
