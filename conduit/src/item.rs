use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::correlation::CorrelationId;
use crate::error::EngineError;
use crate::lease::LeaseId;

/// Unique identifier of a queue item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a queue item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    /// Dispatched on a queue with no registered handler.
    Failed,
    Dead,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Claimed => "claimed",
            ItemStatus::Running => "running",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Dead => "dead",
        }
    }

    /// Terminal items are never touched again by workers.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Dead
        )
    }

    /// Claimed or running, i.e. held under a lease.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ItemStatus::Claimed | ItemStatus::Running)
    }
}

impl Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "claimed" => Ok(ItemStatus::Claimed),
            "running" => Ok(ItemStatus::Running),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            "dead" => Ok(ItemStatus::Dead),
            other => Err(EngineError::InvalidColumn {
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// One unit of work as persisted by the job record store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    /// Insertion order, the last tie-breaker when claiming.
    pub sequence: i64,
    pub correlation_id: CorrelationId,
    pub queue_name: String,
    /// Name of the circuit breaker guarding this item.
    pub dependency: String,
    /// Lower is sooner.
    pub priority: i32,
    pub status: ItemStatus,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_id: Option<LeaseId>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Build the stored form of a freshly enqueued item.
    pub fn from_new(item: NewQueueItem, sequence: i64) -> Self {
        Self {
            id: item.id,
            sequence,
            correlation_id: item.correlation_id,
            queue_name: item.queue_name,
            dependency: item.dependency,
            priority: item.priority,
            status: ItemStatus::Pending,
            payload: item.payload,
            attempt_count: 0,
            max_attempts: item.max_attempts,
            scheduled_at: item.scheduled_at,
            created_at: item.created_at,
            claimed_at: None,
            completed_at: None,
            lease_id: None,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
        }
    }

    /// Whether a claim at `now` may pick this item, ignoring breaker state.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Pending && self.scheduled_at <= now
    }

    /// Whether the lease on this item has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight()
            && self.lease_expires_at.is_some_and(|expires| expires < now)
    }

    /// End-to-end duration for completed items.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.status, self.completed_at) {
            (ItemStatus::Completed, Some(done)) => {
                Some((done - self.created_at).num_milliseconds())
            }
            _ => None,
        }
    }
}

/// Enqueue input as received from intake.
///
/// Only `queue_name` and `payload` are required; everything else falls back
/// to [`QueueConfig`] defaults when the request is validated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub queue_name: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Overrides the queue's configured dependency.
    #[serde(default)]
    pub dependency: Option<String>,
    /// Not eligible before this time; defaults to enqueue time.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(queue_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload,
            priority: 0,
            correlation_id: None,
            max_attempts: None,
            dependency: None,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    /// Validate the request and resolve defaults into a storable item.
    pub fn validate(
        self,
        config: &QueueConfig,
        now: DateTime<Utc>,
    ) -> Result<NewQueueItem, EngineError> {
        let queue_name = self.queue_name.trim();
        if queue_name.is_empty() {
            return Err(EngineError::InvalidEnqueue(
                "queue name must not be blank".into(),
            ));
        }
        if self.payload.is_null() {
            return Err(EngineError::InvalidEnqueue(format!(
                "payload for queue {queue_name:?} is missing"
            )));
        }

        let max_attempts =
            self.max_attempts.unwrap_or(config.default_max_attempts);
        if max_attempts == 0 {
            return Err(EngineError::InvalidEnqueue(
                "max attempts must be at least 1".into(),
            ));
        }

        let dependency = match self.dependency {
            Some(dependency) if dependency.trim().is_empty() => {
                return Err(EngineError::InvalidEnqueue(
                    "dependency must not be blank".into(),
                ));
            }
            Some(dependency) => dependency.trim().to_string(),
            None => config.dependency_for(queue_name).to_string(),
        };

        Ok(NewQueueItem {
            id: ItemId::new(),
            correlation_id: self.correlation_id.unwrap_or_default(),
            queue_name: queue_name.to_string(),
            dependency,
            priority: self.priority,
            payload: self.payload,
            max_attempts,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            created_at: now,
        })
    }
}

/// Validated enqueue input handed to the store.
#[derive(Clone, Debug, PartialEq)]
pub struct NewQueueItem {
    pub id: ItemId,
    pub correlation_id: CorrelationId,
    pub queue_name: String,
    pub dependency: String,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
