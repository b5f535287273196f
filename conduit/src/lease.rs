use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{ItemStatus, QueueItem};
use crate::retry::{FailureClass, RetryDecision, RetryPolicy};

/// Error recorded on items whose lease lapsed without a heartbeat.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// Unique identifier for a claim lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A claimed item together with the lease that guards it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemLease {
    /// Unique identifier for this lease.
    pub lease_id: LeaseId,
    /// ID of the worker holding this lease.
    pub worker_id: String,
    /// Timestamp when the lease expires unless renewed.
    pub expires_at: DateTime<Utc>,
    /// Snapshot of the item as of the last transition made under this lease.
    pub item: QueueItem,
    /// Claimed as the single half-open trial of its dependency's breaker.
    #[serde(default)]
    pub trial: bool,
}

impl ItemLease {
    /// Checks if the lease has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Request to atomically claim the next eligible item of a queue.
#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub queue_name: String,
    /// Dependencies whose breakers currently admit work.
    pub dependencies: Vec<String>,
    /// ID of the worker requesting the claim.
    pub worker_id: String,
    /// Time-to-live for the lease if an item is claimed.
    pub lease_ttl: Duration,
    pub now: DateTime<Utc>,
}

/// Heartbeat extending a lease to `now + extend_by`.
#[derive(Clone, Debug)]
pub struct LeaseRenewal {
    /// ID of the lease to renew.
    pub lease_id: LeaseId,
    /// ID of the worker requesting the renewal.
    pub worker_id: String,
    /// Duration the lease should remain valid from `now`.
    pub extend_by: Duration,
    pub now: DateTime<Utc>,
}

/// Result of resolving an expired lease.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExpiredLeaseOutcome {
    /// Item goes back to pending.
    Resurrected {
        attempt_count: u32,
        scheduled_at: DateTime<Utc>,
    },
    /// Attempts exhausted; item moves to dead.
    DeadLettered { attempt_count: u32 },
}

impl ExpiredLeaseOutcome {
    pub fn attempt_count(&self) -> u32 {
        match self {
            ExpiredLeaseOutcome::Resurrected { attempt_count, .. }
            | ExpiredLeaseOutcome::DeadLettered { attempt_count } => *attempt_count,
        }
    }
}

/// Resolve an item whose lease lapsed.
///
/// Expiry is treated as a transient failure. An item that expired while
/// still `claimed` never started its attempt, so the lapse itself is
/// charged as one.
pub fn process_expired_lease(
    item: &QueueItem,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
    jitter: f64,
) -> ExpiredLeaseOutcome {
    let attempt_count = if item.status == ItemStatus::Claimed {
        item.attempt_count.saturating_add(1).min(item.max_attempts)
    } else {
        item.attempt_count
    };

    match policy.decide(
        attempt_count,
        item.max_attempts,
        FailureClass::Transient,
        now,
        jitter,
    ) {
        RetryDecision::RetryAt(scheduled_at) => ExpiredLeaseOutcome::Resurrected {
            attempt_count,
            scheduled_at,
        },
        RetryDecision::Dead(_) => ExpiredLeaseOutcome::DeadLettered { attempt_count },
    }
}
