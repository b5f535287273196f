use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::EngineError;
use crate::retry::FailureClass;

/// Result of one handler invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// Worth retrying: timeouts, 5xx, rate limiting.
    TransientFailure { error: String },
    /// Never retried: validation errors, malformed payloads, other 4xx.
    PermanentFailure { error: String },
}

impl HandlerOutcome {
    pub fn transient(error: impl Into<String>) -> Self {
        HandlerOutcome::TransientFailure {
            error: error.into(),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        HandlerOutcome::PermanentFailure {
            error: error.into(),
        }
    }

    /// Failure class, `None` on success.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            HandlerOutcome::Success => None,
            HandlerOutcome::TransientFailure { .. } => Some(FailureClass::Transient),
            HandlerOutcome::PermanentFailure { .. } => Some(FailureClass::Permanent),
        }
    }

    /// Error reported by a failed outcome.
    pub fn error(&self) -> Option<&str> {
        match self {
            HandlerOutcome::Success => None,
            HandlerOutcome::TransientFailure { error }
            | HandlerOutcome::PermanentFailure { error } => Some(error),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HandlerOutcome::Success => "success",
            HandlerOutcome::TransientFailure { .. } => "transient_failure",
            HandlerOutcome::PermanentFailure { .. } => "permanent_failure",
        }
    }
}

/// Executes the payload of one queue's items.
///
/// Handlers must be idempotent: delivery is at-least-once, so the same
/// payload can be executed again after a lease expiry or a lost settlement.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn execute(&self, payload: &serde_json::Value) -> HandlerOutcome;
}

/// Queue name to handler, consulted at dispatch time.
///
/// Handlers may be registered while workers are running; an item already
/// marked `failed` for lack of a handler can then be requeued.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.queues())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `queue_name`; one handler per queue.
    pub fn register(
        &self,
        queue_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), EngineError> {
        let queue_name = queue_name.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&queue_name) {
            return Err(EngineError::DuplicateHandler(queue_name));
        }
        tracing::debug!(queue = %queue_name, "handler registered");
        handlers.insert(queue_name, handler);
        Ok(())
    }

    pub fn get(&self, queue_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(queue_name).cloned()
    }

    /// Registered queue names, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.handlers.read().keys().cloned().collect();
        queues.sort();
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn execute(&self, payload: &serde_json::Value) -> HandlerOutcome {
            if payload["ok"] == json!(true) {
                HandlerOutcome::Success
            } else {
                HandlerOutcome::permanent("not ok")
            }
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = HandlerRegistry::new();
        registry.register("klaviyo_sync", Arc::new(Echo)).unwrap();

        let handler = registry.get("klaviyo_sync").unwrap();
        assert_eq!(handler.execute(&json!({"ok": true})).await, HandlerOutcome::Success);
        assert!(registry.get("tixr_pull").is_none());
        assert_eq!(registry.queues(), vec!["klaviyo_sync".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = HandlerRegistry::new();
        registry.register("klaviyo_sync", Arc::new(Echo)).unwrap();
        let err = registry.register("klaviyo_sync", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateHandler(q) if q == "klaviyo_sync"));
    }

    #[test]
    fn test_outcome_failure_class() {
        assert_eq!(HandlerOutcome::Success.failure_class(), None);
        assert_eq!(
            HandlerOutcome::transient("503").failure_class(),
            Some(FailureClass::Transient)
        );
        assert_eq!(
            HandlerOutcome::permanent("400").failure_class(),
            Some(FailureClass::Permanent)
        );
        assert_eq!(HandlerOutcome::Success.error(), None);
        assert_eq!(HandlerOutcome::permanent("400").error(), Some("400"));
    }
}
