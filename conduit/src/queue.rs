use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::item::{ItemId, ItemStatus, NewQueueItem, QueueItem};
use crate::lease::{ClaimRequest, ExpiredLeaseOutcome, ItemLease, LeaseId, LeaseRenewal};

/// Window of recently completed items averaged into [`QueueStats::avg_duration_ms`].
pub const STATS_DURATION_WINDOW: usize = 100;

/// Trait for job record stores.
///
/// Every mutation is a single atomic conditional update: a claim only
/// succeeds on a `pending` row, and lease-holder updates only succeed while
/// the row still carries the caller's lease. Implementors never hold a
/// global queue lock across calls.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert validated items as `pending`, all or nothing.
    async fn insert(&self, items: Vec<NewQueueItem>) -> anyhow::Result<Vec<QueueItem>>;

    /// Distinct dependencies with at least one claimable item in `queue_name`.
    async fn claimable_dependencies(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<String>>;

    /// Atomically claim the best claimable item whose dependency is admitted.
    ///
    /// Order is priority ascending, then `scheduled_at`, then insertion.
    async fn claim_next(&self, request: ClaimRequest) -> anyhow::Result<Option<ItemLease>>;

    /// Move a claimed item to running and count the attempt.
    async fn mark_running(
        &self,
        lease_id: LeaseId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<QueueItem>>;

    /// Extend a held lease; `None` when the lease is gone.
    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Apply a settlement under `lease_id`. Returns false when the lease was lost.
    async fn settle(
        &self,
        lease_id: LeaseId,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn get(&self, id: ItemId) -> anyhow::Result<Option<QueueItem>>;

    /// Every item sharing a correlation id, in insertion order.
    async fn items_for_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<Vec<QueueItem>>;

    async fn stats(&self, queue_name: &str) -> anyhow::Result<QueueStats>;

    /// Distinct queue names present in the store, sorted.
    async fn queue_names(&self) -> anyhow::Result<Vec<String>>;

    /// Move matching `failed`/`dead` items back to `pending`. Returns the count.
    async fn requeue(&self, filter: RequeueFilter, now: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Delete `completed`/`dead` items of `queue_name` finished before `cutoff`.
    async fn cleanup(&self, queue_name: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Trait for scanning and resolving expired leases.
///
/// Reclaim is the only path allowed to mutate an item without holding its
/// lease, and it is conditional on the lease still being the expired one.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// In-flight items whose lease expired before `now`.
    async fn expired_leases(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<QueueItem>>;

    /// Apply `outcome` if `item_id` is still held under `lease_id`.
    async fn reclaim(
        &self,
        item_id: ItemId,
        lease_id: LeaseId,
        outcome: ExpiredLeaseOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

/// Final disposition of one attempt, written under the caller's lease.
#[derive(Clone, Debug, PartialEq)]
pub enum Settlement {
    Completed,
    /// Back to pending until `scheduled_at`.
    Retry {
        scheduled_at: DateTime<Utc>,
        error: String,
    },
    Dead {
        error: String,
    },
    /// No handler was registered for the queue.
    Failed {
        error: String,
    },
}

impl Settlement {
    /// Status the item ends up in.
    pub fn status(&self) -> ItemStatus {
        match self {
            Settlement::Completed => ItemStatus::Completed,
            Settlement::Retry { .. } => ItemStatus::Pending,
            Settlement::Dead { .. } => ItemStatus::Dead,
            Settlement::Failed { .. } => ItemStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Settlement::Completed => None,
            Settlement::Retry { error, .. }
            | Settlement::Dead { error }
            | Settlement::Failed { error } => Some(error),
        }
    }

    /// Metric and log label.
    pub fn label(&self) -> &'static str {
        match self {
            Settlement::Completed => "completed",
            Settlement::Retry { .. } => "retry",
            Settlement::Dead { .. } => "dead",
            Settlement::Failed { .. } => "failed",
        }
    }

    /// Whether the item must already be running. `Failed` may also settle a
    /// claim that never started.
    pub fn requires_running(&self) -> bool {
        !matches!(self, Settlement::Failed { .. })
    }

    /// Whether a stored item in `status` may take this settlement.
    pub fn applies_to(&self, status: ItemStatus) -> bool {
        match status {
            ItemStatus::Running => true,
            ItemStatus::Claimed => !self.requires_running(),
            _ => false,
        }
    }
}

/// Selection for operator requeue.
#[derive(Clone, Debug, PartialEq)]
pub struct RequeueFilter {
    pub queue_name: Option<String>,
    pub item_id: Option<ItemId>,
    /// Only items that reached their terminal state at or before this instant.
    pub completed_before: DateTime<Utc>,
    /// Reset `attempt_count` to zero. Without it, only items with attempts
    /// left are requeued.
    pub reset_attempts: bool,
}

impl RequeueFilter {
    pub fn queue(
        queue_name: impl Into<String>,
        completed_before: DateTime<Utc>,
        reset_attempts: bool,
    ) -> Self {
        Self {
            queue_name: Some(queue_name.into()),
            item_id: None,
            completed_before,
            reset_attempts,
        }
    }

    pub fn item(item_id: ItemId, completed_before: DateTime<Utc>, reset_attempts: bool) -> Self {
        Self {
            queue_name: None,
            item_id: Some(item_id),
            completed_before,
            reset_attempts,
        }
    }

    /// Whether `item` is selected by this filter.
    pub fn matches(&self, item: &QueueItem) -> bool {
        matches!(item.status, ItemStatus::Failed | ItemStatus::Dead)
            && self
                .queue_name
                .as_deref()
                .map_or(true, |queue| item.queue_name == queue)
            && self.item_id.map_or(true, |id| item.id == id)
            && item
                .completed_at
                .is_some_and(|done| done <= self.completed_before)
            && (self.reset_attempts || item.attempt_count < item.max_attempts)
    }
}

/// Point-in-time counts for one queue.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: u64,
    /// Claimed plus running.
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub total: u64,
    /// Mean of `completed_at - created_at` over the most recent completions.
    pub avg_duration_ms: Option<f64>,
    /// Completed share of finished items, as a percentage.
    pub success_rate: f64,
}

impl QueueStats {
    /// Build stats from per-status counts and recent durations.
    pub fn from_counts(
        queue_name: impl Into<String>,
        counts: impl IntoIterator<Item = (ItemStatus, u64)>,
        recent_durations_ms: &[i64],
    ) -> Self {
        let mut stats = QueueStats {
            queue_name: queue_name.into(),
            ..Default::default()
        };
        for (status, count) in counts {
            match status {
                ItemStatus::Pending => stats.pending += count,
                ItemStatus::Claimed | ItemStatus::Running => stats.running += count,
                ItemStatus::Completed => stats.completed += count,
                ItemStatus::Failed => stats.failed += count,
                ItemStatus::Dead => stats.dead += count,
            }
            stats.total += count;
        }

        if !recent_durations_ms.is_empty() {
            let sum: i64 = recent_durations_ms.iter().sum();
            stats.avg_duration_ms = Some(sum as f64 / recent_durations_ms.len() as f64);
        }

        let finished = stats.completed + stats.failed + stats.dead;
        stats.success_rate = stats.completed as f64 / finished.max(1) as f64 * 100.0;
        stats
    }
}
