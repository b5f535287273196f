/// PostgreSQL persistence implementations for the queue and breaker stores.
///
/// This module provides [`PostgresQueueStore`] and [`PostgresBreakerStore`],
/// plus [`connect`] and [`ensure_schema`] for pool setup.
pub mod postgres;

pub use postgres::{connect, ensure_schema, PostgresBreakerStore, PostgresQueueStore};
