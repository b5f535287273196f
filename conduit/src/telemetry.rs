//! Tracing and telemetry instrumentation for the integration engine.
//!
//! Span constructors for the item lifecycle plus `record_*` helpers that log
//! an event and, with the `metrics` feature, update Prometheus. Everything
//! here works with or without that feature.
//!
//! # Example
//!
//! ```ignore
//! use conduit::telemetry::{item_execute_span, record_item_settled};
//!
//! let span = item_execute_span(item_id, "klaviyo_sync", "klaviyo_api");
//! let _enter = span.enter();
//! // ... handler execution
//! record_item_settled("klaviyo_sync", item_id, "completed");
//! ```

use std::future::Future;

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `logging.level`. Calling this twice is harmless; the
/// second call leaves the first subscriber in place.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Span around one worker claim attempt.
#[must_use]
pub fn item_claim_span(worker_id: impl AsRef<str>, queue: impl AsRef<str>) -> Span {
    info_span!(
        "conduit.claim",
        worker_id = %worker_id.as_ref(),
        queue = %queue.as_ref(),
    )
}

/// Span around a handler invocation.
#[must_use]
pub fn item_execute_span(
    item_id: impl AsRef<str>,
    queue: impl AsRef<str>,
    dependency: impl AsRef<str>,
) -> Span {
    info_span!(
        "conduit.execute",
        item_id = %item_id.as_ref(),
        queue = %queue.as_ref(),
        dependency = %dependency.as_ref(),
    )
}

/// Span around writing an attempt's outcome.
#[must_use]
pub fn item_settle_span(item_id: impl AsRef<str>, outcome: impl AsRef<str>) -> Span {
    info_span!(
        "conduit.settle",
        item_id = %item_id.as_ref(),
        outcome = %outcome.as_ref(),
    )
}

#[must_use]
pub fn lease_renew_span(lease_id: impl AsRef<str>, item_id: impl AsRef<str>) -> Span {
    info_span!(
        "conduit.renew",
        lease_id = %lease_id.as_ref(),
        item_id = %item_id.as_ref(),
    )
}

#[must_use]
pub fn item_enqueue_span(queue: impl AsRef<str>, correlation_id: impl AsRef<str>) -> Span {
    info_span!(
        "conduit.enqueue",
        queue = %queue.as_ref(),
        correlation_id = %correlation_id.as_ref(),
    )
}

/// Attach an execute span to a future.
pub fn instrument_execute<F>(
    item_id: impl AsRef<str>,
    queue: impl AsRef<str>,
    dependency: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(item_execute_span(item_id, queue, dependency))
}

pub fn record_item_enqueued(queue: impl AsRef<str>, item_id: impl AsRef<str>) {
    tracing::info!(
        queue = %queue.as_ref(),
        item_id = %item_id.as_ref(),
        "item enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_item_enqueued(queue.as_ref());
}

/// Record the outcome of one attempt (completed, retry, dead, failed).
pub fn record_item_settled(
    queue: impl AsRef<str>,
    item_id: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    tracing::info!(
        queue = %queue.as_ref(),
        item_id = %item_id.as_ref(),
        outcome = %outcome.as_ref(),
        "item settled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_item_settled(queue.as_ref(), outcome.as_ref());
}

pub fn record_lease_expired(queue: impl AsRef<str>, item_id: impl AsRef<str>) {
    tracing::warn!(
        queue = %queue.as_ref(),
        item_id = %item_id.as_ref(),
        "lease expired"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_expired(queue.as_ref());
}

/// Record a breaker moving between states.
pub fn record_breaker_transition(
    dependency: impl AsRef<str>,
    from: impl AsRef<str>,
    to: impl AsRef<str>,
    failure_count: u32,
) {
    tracing::warn!(
        dependency = %dependency.as_ref(),
        from = %from.as_ref(),
        to = %to.as_ref(),
        failure_count,
        "circuit breaker transition"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_breaker_transition(dependency.as_ref(), to.as_ref());
}

pub fn observe_item_duration(
    queue: impl AsRef<str>,
    outcome: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::debug!(
        queue = %queue.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs,
        "item duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_item_duration(queue.as_ref(), outcome.as_ref(), duration_secs);
}

/// Start timing a handler invocation.
pub fn record_item_start(item_id: impl AsRef<str>) -> ItemTimingHandle {
    ItemTimingHandle {
        item_id: item_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Finish timing and observe the duration under `outcome`.
pub fn record_item_end(
    handle: ItemTimingHandle,
    queue: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    observe_item_duration(queue, outcome, handle.start.elapsed().as_secs_f64());
}

/// Opaque handle returned by [`record_item_start`].
#[derive(Debug)]
pub struct ItemTimingHandle {
    item_id: String,
    start: std::time::Instant,
}

impl ItemTimingHandle {
    #[must_use]
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
