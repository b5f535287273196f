use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::breaker::{BreakerStore, CircuitBreakerRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::events::{InProcEventBus, ItemEventPublisher};
use crate::manager::QueueManager;
use crate::queue::{LeaseExpiryScanner, QueueStore};

use super::handler::{HandlerRegistry, JobHandler};
use super::supervisor::IntegrationEngine;

/// Builder for an [`IntegrationEngine`] with explicit dependencies.
///
/// Both stores are required. The clock defaults to [`SystemClock`] and the
/// event publisher to an [`InProcEventBus`] sized by
/// `runtime.event_capacity`.
///
/// # Example
///
/// ```ignore
/// use conduit::*;
///
/// let engine = IntegrationEngineBuilder::new(EngineConfig::load()?)
///     .with_queue_store(queue_store)
///     .with_breaker_store(breaker_store)
///     .with_handler("klaviyo_sync", Arc::new(KlaviyoSync::new(client)))?
///     .build()?;
/// engine.start().await?;
/// engine.spawn_worker_pool("klaviyo_sync", 4).await;
/// ```
pub struct IntegrationEngineBuilder<Q, B> {
    config: EngineConfig,
    queue_store: Option<Arc<Q>>,
    breaker_store: Option<Arc<B>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn ItemEventPublisher>>,
    handlers: HandlerRegistry,
}

impl<Q, B> fmt::Debug for IntegrationEngineBuilder<Q, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("IntegrationEngineBuilder");
        debug.field("config", &self.config);
        debug.field("queue_store_set", &self.queue_store.is_some());
        debug.field("breaker_store_set", &self.breaker_store.is_some());
        debug.field("clock_set", &self.clock.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("handlers", &self.handlers);

        if self.queue_store.is_some() {
            debug.field("queue_store_type", &type_name::<Q>());
        }
        if self.breaker_store.is_some() {
            debug.field("breaker_store_type", &type_name::<B>());
        }

        debug.finish()
    }
}

impl<Q, B> IntegrationEngineBuilder<Q, B>
where
    Q: QueueStore + LeaseExpiryScanner + 'static,
    B: BreakerStore + 'static,
{
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            queue_store: None,
            breaker_store: None,
            clock: None,
            events: None,
            handlers: HandlerRegistry::new(),
        }
    }

    /// Set the job record store.
    pub fn with_queue_store(mut self, store: Arc<Q>) -> Self {
        self.queue_store = Some(store);
        self
    }

    /// Set the circuit breaker store.
    pub fn with_breaker_store(mut self, store: Arc<B>) -> Self {
        self.breaker_store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn ItemEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a handler up front.
    ///
    /// # Errors
    ///
    /// Fails with `EngineError::DuplicateHandler` if the queue already has one.
    pub fn with_handler(
        self,
        queue_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> anyhow::Result<Self> {
        self.handlers.register(queue_name, handler)?;
        Ok(self)
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if either store is missing.
    pub fn build(self) -> anyhow::Result<IntegrationEngine<Q, B>> {
        let queue_store = self
            .queue_store
            .ok_or_else(|| anyhow::anyhow!("queue store dependency missing"))?;
        let breaker_store = self
            .breaker_store
            .ok_or_else(|| anyhow::anyhow!("breaker store dependency missing"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_else(|| {
            Arc::new(InProcEventBus::new(self.config.runtime.event_capacity.max(1)))
        });

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            breaker_store,
            self.config.breaker.clone(),
        ));
        let manager = Arc::new(QueueManager::new(
            queue_store,
            breakers,
            self.config.retry.clone(),
            self.config.queue.clone(),
            self.config.runtime.lease_ttl(),
            clock,
            events,
        ));

        Ok(IntegrationEngine::new(
            self.config.runtime,
            manager,
            Arc::new(self.handlers),
        ))
    }
}
