/// Runtime builder for constructing engine instances.
pub mod builder;
/// Handler trait and per-queue handler registry.
pub mod handler;
/// Engine handle, worker pools, housekeeping and shutdown.
pub mod supervisor;
/// Worker configuration and guarded handler execution.
pub mod worker;

pub use builder::IntegrationEngineBuilder;
pub use handler::{HandlerOutcome, HandlerRegistry, JobHandler};
pub use supervisor::{IntegrationEngine, RuntimeConfig, ShutdownToken};
pub use worker::{execute_guarded, WorkerConfig};
