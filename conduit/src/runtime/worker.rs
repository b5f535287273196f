use std::any::Any;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::handler::{HandlerOutcome, JobHandler};
use super::supervisor::RuntimeConfig;

/// Configuration for one worker task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for this worker, recorded as the lease owner.
    pub worker_id: String,
    /// Queue this worker claims from.
    pub queue_name: String,
    /// Sleep when nothing is claimable, in milliseconds.
    pub poll_interval_ms: u64,
    /// Sleep after a store error, in milliseconds.
    pub error_backoff_ms: u64,
    /// Upper bound on one handler invocation, in seconds.
    pub handler_timeout_secs: u64,
    pub lease_ttl_secs: i64,
    /// Fraction of the TTL that elapses before the renewer heartbeats.
    pub renew_at_fraction: f32,
    /// Never renew later than this many seconds before expiry.
    pub renew_min_margin_secs: i64,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self::from_runtime(worker_id, queue_name, &RuntimeConfig::default())
    }

    /// Worker settings derived from the runtime configuration.
    pub fn from_runtime(
        worker_id: impl Into<String>,
        queue_name: impl Into<String>,
        runtime: &RuntimeConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue_name: queue_name.into(),
            poll_interval_ms: runtime.poll_interval_ms,
            error_backoff_ms: runtime.error_backoff_ms,
            handler_timeout_secs: runtime.handler_timeout_secs,
            lease_ttl_secs: runtime.lease_ttl_secs,
            renew_at_fraction: runtime.renew_at_fraction,
            renew_min_margin_secs: runtime.renew_min_margin_secs,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_error_backoff(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    pub fn with_handler_timeout(mut self, secs: u64) -> Self {
        self.handler_timeout_secs = secs;
        self
    }

    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> StdDuration {
        StdDuration::from_millis(self.error_backoff_ms)
    }

    pub fn handler_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.handler_timeout_secs)
    }

    /// How long the renewer sleeps before the next heartbeat.
    ///
    /// Wakes once `renew_at_fraction` of the TTL has elapsed, or
    /// `renew_min_margin_secs` before expiry if that is already past, or
    /// immediately when even the margin is gone.
    pub fn renew_delay(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> StdDuration {
        if expires_at <= now {
            return StdDuration::ZERO;
        }
        let ttl_total = Duration::seconds(self.lease_ttl_secs)
            .to_std()
            .unwrap_or(StdDuration::from_secs(30));
        let target = ttl_total.mul_f32(1.0 - self.renew_at_fraction.clamp(0.0, 1.0));
        let margin = StdDuration::from_secs(self.renew_min_margin_secs.max(0) as u64);
        let remaining = (expires_at - now).to_std().unwrap_or(StdDuration::ZERO);

        if remaining > target {
            remaining - target
        } else if remaining > margin {
            remaining - margin
        } else {
            StdDuration::ZERO
        }
    }
}

/// Run `handler` on its own task, bounded by `timeout`.
///
/// A panic or a timeout becomes a transient failure. On timeout the task is
/// aborted so it cannot outlive the claim.
pub async fn execute_guarded(
    handler: Arc<dyn JobHandler>,
    payload: serde_json::Value,
    timeout: StdDuration,
) -> HandlerOutcome {
    let mut task = tokio::spawn(async move { handler.execute(&payload).await });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) if err.is_panic() => HandlerOutcome::transient(format!(
            "handler panicked: {}",
            panic_message(err.into_panic())
        )),
        Ok(Err(err)) => HandlerOutcome::transient(format!("handler task cancelled: {err}")),
        Err(_) => {
            task.abort();
            HandlerOutcome::transient(format!(
                "handler timed out after {}s",
                timeout.as_secs_f64()
            ))
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
