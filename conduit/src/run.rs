use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::error::EngineError;
use crate::item::{ItemStatus, QueueItem};
use crate::queue::QueueStore;

/// Aggregate status of an integration run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one item is still pending or in flight and none has died.
    Pending,
    /// Every item completed.
    Completed,
    /// At least one item ended dead or failed.
    Failed,
}

/// Items sharing a correlation id, summarized.
///
/// Derived from item state on every read and never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRun {
    pub correlation_id: CorrelationId,
    pub status: RunStatus,
    pub total_items: u64,
    pub successful_items: u64,
    /// Dead plus failed items.
    pub failed_items: u64,
    /// Pending, claimed or running items.
    pub pending_items: u64,
    pub started_at: DateTime<Utc>,
    /// Set once every item is terminal.
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl IntegrationRun {
    /// Summarize `items`; `None` when there are none.
    pub fn from_items(correlation_id: CorrelationId, items: &[QueueItem]) -> Option<Self> {
        let started_at = items.iter().map(|item| item.created_at).min()?;

        let mut successful_items = 0;
        let mut failed_items = 0;
        let mut pending_items = 0;
        for item in items {
            match item.status {
                ItemStatus::Completed => successful_items += 1,
                ItemStatus::Dead | ItemStatus::Failed => failed_items += 1,
                ItemStatus::Pending | ItemStatus::Claimed | ItemStatus::Running => {
                    pending_items += 1
                }
            }
        }

        let status = if failed_items > 0 {
            RunStatus::Failed
        } else if pending_items == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Pending
        };

        let completed_at = if pending_items == 0 {
            items.iter().filter_map(|item| item.completed_at).max()
        } else {
            None
        };

        let last_error = items
            .iter()
            .filter(|item| matches!(item.status, ItemStatus::Dead | ItemStatus::Failed))
            .filter_map(|item| Some((item.completed_at?, item.last_error.as_ref()?)))
            .max_by_key(|(at, _)| *at)
            .map(|(_, error)| error.clone());

        Some(Self {
            correlation_id,
            status,
            total_items: items.len() as u64,
            successful_items,
            failed_items,
            pending_items,
            started_at,
            completed_at,
            last_error,
        })
    }
}

/// Read-side view over runs, recomputed from the store on each call.
#[derive(Debug)]
pub struct RunTracker<Q> {
    store: Arc<Q>,
}

impl<Q: QueueStore> RunTracker<Q> {
    pub fn new(store: Arc<Q>) -> Self {
        Self { store }
    }

    pub async fn get_run(&self, correlation_id: &CorrelationId) -> anyhow::Result<IntegrationRun> {
        let items = self.store.items_for_correlation(correlation_id).await?;
        IntegrationRun::from_items(correlation_id.clone(), &items)
            .ok_or_else(|| EngineError::RunNotFound(correlation_id.clone()).into())
    }
}
