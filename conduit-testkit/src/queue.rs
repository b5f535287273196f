use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory job record store.
///
/// Every operation takes the single state lock once, so each call is one
/// atomic conditional update, mirroring the row-level guarantees of the
/// PostgreSQL store.
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    items: HashMap<ItemId, QueueItem>,
    next_sequence: i64,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored item, in insertion order.
    pub fn items(&self) -> Vec<QueueItem> {
        let state = self.state.lock();
        let mut items: Vec<QueueItem> = state.items.values().cloned().collect();
        items.sort_by_key(|item| item.sequence);
        items
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a stored item, for arranging fixtures that the public
    /// lifecycle cannot reach directly.
    pub fn put(&self, item: QueueItem) {
        self.state.lock().items.insert(item.id, item);
    }
}

impl std::fmt::Debug for InMemoryQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueueStore")
            .field("items", &self.len())
            .finish()
    }
}

fn clear_lease(item: &mut QueueItem) {
    item.lease_id = None;
    item.lease_owner = None;
    item.lease_expires_at = None;
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, items: Vec<NewQueueItem>) -> anyhow::Result<Vec<QueueItem>> {
        let mut state = self.state.lock();
        if let Some(dup) = items.iter().find(|item| state.items.contains_key(&item.id)) {
            anyhow::bail!("duplicate item id {}", dup.id);
        }

        let mut out = Vec::with_capacity(items.len());
        for new in items {
            state.next_sequence += 1;
            let item = QueueItem::from_new(new, state.next_sequence);
            state.items.insert(item.id, item.clone());
            out.push(item);
        }
        Ok(out)
    }

    async fn claimable_dependencies(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock();
        let mut deps: Vec<String> = state
            .items
            .values()
            .filter(|item| item.queue_name == queue_name && item.is_claimable(now))
            .map(|item| item.dependency.clone())
            .collect();
        deps.sort();
        deps.dedup();
        Ok(deps)
    }

    async fn claim_next(&self, request: ClaimRequest) -> anyhow::Result<Option<ItemLease>> {
        let mut state = self.state.lock();

        let next = state
            .items
            .values()
            .filter(|item| {
                item.queue_name == request.queue_name
                    && item.is_claimable(request.now)
                    && request.dependencies.contains(&item.dependency)
            })
            .min_by_key(|item| (item.priority, item.scheduled_at, item.sequence))
            .map(|item| item.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(item) = state.items.get_mut(&id) else {
            return Ok(None);
        };

        let lease_id = LeaseId::new();
        let expires_at = request.now + request.lease_ttl;
        item.status = ItemStatus::Claimed;
        item.claimed_at = Some(request.now);
        item.lease_id = Some(lease_id);
        item.lease_owner = Some(request.worker_id.clone());
        item.lease_expires_at = Some(expires_at);

        Ok(Some(ItemLease {
            lease_id,
            worker_id: request.worker_id,
            expires_at,
            item: item.clone(),
            trial: false,
        }))
    }

    async fn mark_running(
        &self,
        lease_id: LeaseId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<QueueItem>> {
        let mut state = self.state.lock();
        let item = state.items.values_mut().find(|item| {
            item.lease_id == Some(lease_id)
                && item.status == ItemStatus::Claimed
                && item.lease_expires_at.is_some_and(|expires| expires >= now)
        });

        Ok(item.map(|item| {
            item.status = ItemStatus::Running;
            item.attempt_count += 1;
            item.clone()
        }))
    }

    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<Option<DateTime<Utc>>> {
        let mut state = self.state.lock();
        let item = state.items.values_mut().find(|item| {
            item.lease_id == Some(renewal.lease_id)
                && item.lease_owner.as_deref() == Some(renewal.worker_id.as_str())
                && item.status.is_in_flight()
                && item
                    .lease_expires_at
                    .is_some_and(|expires| expires >= renewal.now)
        });

        Ok(item.map(|item| {
            let expires_at = renewal.now + renewal.extend_by;
            item.lease_expires_at = Some(expires_at);
            expires_at
        }))
    }

    async fn settle(
        &self,
        lease_id: LeaseId,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(item) = state
            .items
            .values_mut()
            .find(|item| item.lease_id == Some(lease_id) && settlement.applies_to(item.status))
        else {
            return Ok(false);
        };

        item.status = settlement.status();
        if let Some(error) = settlement.error() {
            item.last_error = Some(error.to_string());
        }
        match &settlement {
            Settlement::Retry { scheduled_at, .. } => {
                item.scheduled_at = *scheduled_at;
                item.claimed_at = None;
                item.completed_at = None;
            }
            _ => item.completed_at = Some(now),
        }
        clear_lease(item);
        Ok(true)
    }

    async fn get(&self, id: ItemId) -> anyhow::Result<Option<QueueItem>> {
        Ok(self.state.lock().items.get(&id).cloned())
    }

    async fn items_for_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<Vec<QueueItem>> {
        let state = self.state.lock();
        let mut items: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| &item.correlation_id == correlation_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.sequence);
        Ok(items)
    }

    async fn stats(&self, queue_name: &str) -> anyhow::Result<QueueStats> {
        let state = self.state.lock();
        let mut counts: HashMap<ItemStatus, u64> = HashMap::new();
        let mut completed: Vec<&QueueItem> = Vec::new();

        for item in state.items.values().filter(|item| item.queue_name == queue_name) {
            *counts.entry(item.status).or_default() += 1;
            if item.status == ItemStatus::Completed {
                completed.push(item);
            }
        }

        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        let durations: Vec<i64> = completed
            .iter()
            .take(STATS_DURATION_WINDOW)
            .filter_map(|item| item.duration_ms())
            .collect();

        Ok(QueueStats::from_counts(queue_name, counts, &durations))
    }

    async fn queue_names(&self) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .items
            .values()
            .map(|item| item.queue_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn requeue(&self, filter: RequeueFilter, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let mut requeued = 0;

        for item in state.items.values_mut().filter(|item| filter.matches(item)) {
            item.status = ItemStatus::Pending;
            item.scheduled_at = now;
            item.claimed_at = None;
            item.completed_at = None;
            if filter.reset_attempts {
                item.attempt_count = 0;
            }
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn cleanup(&self, queue_name: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let before = state.items.len();
        state.items.retain(|_, item| {
            !(item.queue_name == queue_name
                && matches!(item.status, ItemStatus::Completed | ItemStatus::Dead)
                && item.completed_at.is_some_and(|done| done < cutoff))
        });
        Ok((before - state.items.len()) as u64)
    }
}

#[async_trait]
impl LeaseExpiryScanner for InMemoryQueueStore {
    async fn expired_leases(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<QueueItem>> {
        let state = self.state.lock();
        let mut expired: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| item.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|item| item.lease_expires_at);
        Ok(expired)
    }

    async fn reclaim(
        &self,
        item_id: ItemId,
        lease_id: LeaseId,
        outcome: ExpiredLeaseOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(item) = state.items.get_mut(&item_id) else {
            return Ok(false);
        };
        if item.lease_id != Some(lease_id) || !item.status.is_in_flight() {
            return Ok(false);
        }

        item.attempt_count = outcome.attempt_count();
        item.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
        item.claimed_at = None;
        match outcome {
            ExpiredLeaseOutcome::Resurrected { scheduled_at, .. } => {
                item.status = ItemStatus::Pending;
                item.scheduled_at = scheduled_at;
            }
            ExpiredLeaseOutcome::DeadLettered { .. } => {
                item.status = ItemStatus::Dead;
                item.completed_at = Some(now);
            }
        }
        clear_lease(item);
        Ok(true)
    }
}

/// In-memory breaker rows with version-checked writes.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBreakerStore {
    rows: Arc<Mutex<HashMap<String, CircuitBreakerState>>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row unconditionally.
    pub fn put(&self, state: CircuitBreakerState) {
        self.rows.lock().insert(state.dependency.clone(), state);
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn load(&self, dependency: &str) -> anyhow::Result<Option<CircuitBreakerState>> {
        Ok(self.rows.lock().get(dependency).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: &CircuitBreakerState,
    ) -> anyhow::Result<bool> {
        let mut rows = self.rows.lock();
        let current = rows.get(&next.dependency).map(|row| row.version);
        if current != expected_version {
            return Ok(false);
        }
        rows.insert(next.dependency.clone(), next.clone());
        Ok(true)
    }

    async fn list(&self) -> anyhow::Result<Vec<CircuitBreakerState>> {
        let mut rows: Vec<CircuitBreakerState> = self.rows.lock().values().cloned().collect();
        rows.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        Ok(rows)
    }
}
