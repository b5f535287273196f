use thiserror::Error;

use crate::correlation::CorrelationId;

/// Errors callers are expected to branch on.
///
/// Engine operations return `anyhow::Result`; these variants travel inside
/// the `anyhow::Error` and can be recovered with `downcast_ref::<EngineError>()`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Enqueue input was missing a required field or carried an invalid value.
    #[error("invalid enqueue request: {0}")]
    InvalidEnqueue(String),

    /// No queue items exist for the correlation id.
    #[error("no integration run found for correlation id {0}")]
    RunNotFound(CorrelationId),

    /// A handler is already registered for the queue.
    #[error("a handler is already registered for queue {0:?}")]
    DuplicateHandler(String),

    /// Breaker state kept changing underneath every compare-and-swap attempt.
    #[error("breaker update for {dependency:?} lost {attempts} consecutive races")]
    BreakerContention {
        /// Dependency whose breaker could not be updated.
        dependency: String,
        /// Number of compare-and-swap attempts made.
        attempts: u32,
    },

    /// A persisted column held a value the engine cannot decode.
    #[error("invalid value {value:?} for column {column}")]
    InvalidColumn {
        /// Column name.
        column: &'static str,
        /// Offending value.
        value: String,
    },
}
