use chrono::{DateTime, Utc};
use conduit::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const KLAVIYO_SYNC: &str = "klaviyo_sync";
pub const KLAVIYO_API: &str = "klaviyo_api";
pub const TIXR_PULL: &str = "tixr_pull";
pub const TIXR_API: &str = "tixr_api";

/// A TIXR order as pushed to Klaviyo, the typical sync payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderSync {
    pub order_id: u64,
    pub email: String,
    pub event_name: String,
}

impl OrderSync {
    pub fn new(order_id: u64) -> Self {
        Self {
            order_id,
            email: format!("fan{order_id}@example.com"),
            event_name: "Summer Festival".to_string(),
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        json!(self)
    }

    /// Request for the `klaviyo_sync` queue guarded by `klaviyo_api`.
    pub fn request(&self) -> EnqueueRequest {
        EnqueueRequest::new(KLAVIYO_SYNC, self.payload()).with_dependency(KLAVIYO_API)
    }
}

/// Config routing the fixture queues to their dependencies.
pub fn queue_config() -> QueueConfig {
    let mut config = QueueConfig::default();
    config
        .dependencies
        .insert(KLAVIYO_SYNC.to_string(), KLAVIYO_API.to_string());
    config
        .dependencies
        .insert(TIXR_PULL.to_string(), TIXR_API.to_string());
    config
}

/// Validate and store one request through `store`, bypassing the manager.
pub async fn seed(
    store: &impl QueueStore,
    request: EnqueueRequest,
    now: DateTime<Utc>,
) -> anyhow::Result<QueueItem> {
    let new = request.validate(&queue_config(), now)?;
    let mut items = store.insert(vec![new]).await?;
    items
        .pop()
        .ok_or_else(|| anyhow::anyhow!("store returned no item"))
}
