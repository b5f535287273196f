//! Prometheus metrics for the integration engine.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `conduit_items_enqueued_total` - Items accepted by enqueue
//! - `conduit_items_settled_total` - Attempts settled, by outcome
//! - `conduit_lease_expired_total` - Leases reclaimed by the housekeeper
//! - `conduit_breaker_transitions_total` - Breaker state changes
//!
//! ## Gauges
//! - `conduit_breaker_state` - 0 closed, 1 half-open, 2 open
//!
//! ## Histograms
//! - `conduit_item_duration_seconds` - Handler execution time
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for engine metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `queue`.
pub static ITEMS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conduit_items_enqueued_total",
        "Total number of queue items enqueued",
    );
    CounterVec::new(opts, &["queue"]).expect("conduit_items_enqueued_total metric creation failed")
});

/// Labels: `queue`, `outcome` (completed, retry, dead, failed).
pub static ITEMS_SETTLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conduit_items_settled_total",
        "Total number of item attempts settled",
    );
    CounterVec::new(opts, &["queue", "outcome"])
        .expect("conduit_items_settled_total metric creation failed")
});

/// Labels: `queue`.
pub static LEASE_EXPIRED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conduit_lease_expired_total",
        "Total number of expired leases reclaimed",
    );
    CounterVec::new(opts, &["queue"]).expect("conduit_lease_expired_total metric creation failed")
});

/// Labels: `dependency`, `state` (the state entered).
pub static BREAKER_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conduit_breaker_transitions_total",
        "Total number of circuit breaker state transitions",
    );
    CounterVec::new(opts, &["dependency", "state"])
        .expect("conduit_breaker_transitions_total metric creation failed")
});

/// Labels: `dependency`.
pub static BREAKER_STATE: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conduit_breaker_state",
        "Circuit breaker state (0 closed, 1 half-open, 2 open)",
    );
    GaugeVec::new(opts, &["dependency"]).expect("conduit_breaker_state metric creation failed")
});

/// Labels: `queue`, `outcome`.
pub static ITEM_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.005, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "conduit_item_duration_seconds",
        "Handler execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "outcome"])
        .expect("conduit_item_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(ITEMS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(ITEMS_SETTLED_TOTAL.clone()),
        Box::new(LEASE_EXPIRED_TOTAL.clone()),
        Box::new(BREAKER_TRANSITIONS_TOTAL.clone()),
        Box::new(BREAKER_STATE.clone()),
        Box::new(ITEM_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_item_enqueued(queue: &str) {
    ITEMS_ENQUEUED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_item_settled(queue: &str, outcome: &str) {
    ITEMS_SETTLED_TOTAL.with_label_values(&[queue, outcome]).inc();
}

pub fn record_lease_expired(queue: &str) {
    LEASE_EXPIRED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_breaker_transition(dependency: &str, state: &str) {
    BREAKER_TRANSITIONS_TOTAL
        .with_label_values(&[dependency, state])
        .inc();

    let value = match state {
        "open" => 2.0,
        "half_open" => 1.0,
        _ => 0.0,
    };
    BREAKER_STATE.with_label_values(&[dependency]).set(value);
}

pub fn observe_item_duration(queue: &str, outcome: &str, duration_secs: f64) {
    ITEM_DURATION_SECONDS
        .with_label_values(&[queue, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
