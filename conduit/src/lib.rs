//! Conduit - durable job engine for TIXR to Klaviyo integration syncs.
//!
//! Provides the queue, worker pool, retry policy, per-dependency circuit
//! breakers and run tracking behind a single [`IntegrationEngine`] handle.
//!
//! # Core Concepts
//!
//! - **Queue item**: One unit of integration work, enqueued into a named
//!   queue with a JSON payload, a priority and the external dependency it
//!   calls. See [`QueueItem`] and [`EnqueueRequest`].
//!
//! - **Lease**: Workers claim items under a time-bounded [`ItemLease`]. A
//!   lease that lapses without renewal is reclaimed by the housekeeper and the
//!   item is retried or dead-lettered.
//!
//! - **Retry policy**: [`RetryPolicy`] turns a failed attempt into either a
//!   rescheduled retry with jittered exponential backoff or a dead letter.
//!
//! - **Circuit breakers**: [`CircuitBreakerRegistry`] keeps one breaker per
//!   dependency. While a breaker is open, items calling that dependency stay
//!   pending and are not claimed.
//!
//! - **Runs**: Items sharing a [`CorrelationId`] form an [`IntegrationRun`]
//!   whose status is derived from its items.
//!
//! - **Runtime**: [`IntegrationEngine`] owns worker pools, lease renewal,
//!   housekeeping and graceful shutdown.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use conduit::*;
//! use std::sync::Arc;
//!
//! let engine = IntegrationEngineBuilder::new(EngineConfig::load()?)
//!     .with_queue_store(Arc::new(queue_store))
//!     .with_breaker_store(Arc::new(breaker_store))
//!     .with_handler("klaviyo_sync", Arc::new(KlaviyoSync::new(client)))?
//!     .build()?;
//!
//! engine.start().await?;
//! engine.spawn_worker_pool("klaviyo_sync", 4).await;
//!
//! let run = CorrelationId::new();
//! engine
//!     .enqueue(
//!         EnqueueRequest::new("klaviyo_sync", serde_json::json!({"order_id": 42}))
//!             .with_correlation_id(run.clone())
//!             .with_dependency("klaviyo_api"),
//!     )
//!     .await?;
//! ```

/// Per-dependency circuit breakers.
///
/// The `breaker` module provides the pure [`CircuitBreakerState`] transitions,
/// the [`BreakerStore`] persistence seam and the [`CircuitBreakerRegistry`]
/// that applies transitions with optimistic concurrency.
pub mod breaker;

/// Time source abstraction.
pub mod clock;

/// Configuration structures for the engine.
///
/// The `config` module defines [`EngineConfig`] and its sections, loaded from
/// defaults, an optional TOML file and `CONDUIT_` environment variables.
pub mod config;

/// Correlation identifiers grouping items into runs.
pub mod correlation;

/// Engine error type.
pub mod error;

/// Item lifecycle events.
///
/// The `events` module provides [`ItemEvent`], the [`ItemEventPublisher`]
/// trait and [`InProcEventBus`] for in-process broadcasting.
pub mod events;

/// Queue items, statuses and enqueue requests.
pub mod item;

/// Lease management for item execution.
///
/// The `lease` module provides lease-based processing:
/// - [`ItemLease`] - a claimed item
/// - [`ClaimRequest`] and [`LeaseRenewal`] - store requests
/// - [`process_expired_lease`] - what happens to an item whose lease lapsed
pub mod lease;

/// Queue manager tying stores, breakers and retry policy together.
pub mod manager;

#[cfg(feature = "metrics")]
/// Prometheus metrics for items, leases and breakers.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides PostgreSQL-backed queue and breaker
/// stores when the `postgres` feature is enabled.
pub mod persistence;

/// Queue storage seam and statistics.
///
/// The `queue` module defines the [`QueueStore`] trait for queue backends and
/// [`LeaseExpiryScanner`] for reclaiming expired leases, plus [`QueueStats`].
pub mod queue;

/// Retry classification and backoff.
pub mod retry;

/// Run status derived from a correlation's items.
pub mod run;

/// Runtime orchestration and worker management.
///
/// The `runtime` module provides the [`IntegrationEngine`] for managing
/// worker pools, lease renewal, and item execution lifecycle. Includes:
/// - [`IntegrationEngineBuilder`] - constructs an engine from its stores
/// - [`RuntimeConfig`] - runtime configuration
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`JobHandler`] and [`HandlerRegistry`] - per-queue item execution
/// - [`WorkerConfig`] - individual worker configuration
pub mod runtime;

/// Tracing initialisation, spans and metric hooks.
pub mod telemetry;

pub use breaker::*;
pub use clock::*;
pub use config::*;
pub use correlation::*;
pub use error::*;
pub use events::*;
pub use item::*;
pub use lease::*;
pub use manager::*;
pub use queue::*;
pub use retry::*;
pub use run::*;
pub use runtime::*;
