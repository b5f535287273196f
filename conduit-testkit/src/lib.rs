//! Test support for conduit: in-memory stores, a manual clock, scripted
//! handlers and payload fixtures.

pub mod clock;
pub mod job;
pub mod mock;
pub mod queue;

pub use clock::ManualClock;
pub use job::*;
pub use mock::{MockHandler, MockStep};
pub use queue::{InMemoryBreakerStore, InMemoryQueueStore};

use conduit::*;
use std::sync::Arc;

/// Engine over in-memory stores with the fixture queue config.
pub type TestEngine = IntegrationEngine<InMemoryQueueStore, InMemoryBreakerStore>;
pub type TestManager = QueueManager<InMemoryQueueStore, InMemoryBreakerStore>;

/// Stores, clock and event bus shared by a test's manager or engine.
#[derive(Clone, Debug)]
pub struct Harness {
    pub queue: Arc<InMemoryQueueStore>,
    pub breakers: Arc<InMemoryBreakerStore>,
    pub clock: ManualClock,
    pub events: Arc<InProcEventBus>,
    pub config: EngineConfig,
}

impl Harness {
    /// Fresh stores, a clock at the fixture epoch and zero retry jitter.
    pub fn new() -> Self {
        let mut config = EngineConfig::default();
        config.queue = queue_config();
        config.retry.jitter_ratio = 0.0;
        Self {
            queue: Arc::new(InMemoryQueueStore::new()),
            breakers: Arc::new(InMemoryBreakerStore::new()),
            clock: ManualClock::epoch(),
            events: Arc::new(InProcEventBus::default()),
            config,
        }
    }

    pub fn with_config(mut self, f: impl FnOnce(&mut EngineConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn manager(&self) -> TestManager {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            Arc::clone(&self.breakers),
            self.config.breaker.clone(),
        ));
        QueueManager::new(
            Arc::clone(&self.queue),
            breakers,
            self.config.retry.clone(),
            self.config.queue.clone(),
            self.config.runtime.lease_ttl(),
            Arc::new(self.clock.clone()),
            self.events.clone(),
        )
    }

    /// Engine builder wired to this harness.
    pub fn builder(&self) -> IntegrationEngineBuilder<InMemoryQueueStore, InMemoryBreakerStore> {
        IntegrationEngineBuilder::new(self.config.clone())
            .with_queue_store(Arc::clone(&self.queue))
            .with_breaker_store(Arc::clone(&self.breakers))
            .with_clock(Arc::new(self.clock.clone()))
            .with_events(self.events.clone())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
