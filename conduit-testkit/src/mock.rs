use async_trait::async_trait;
use conduit::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// What a scripted [`MockHandler`] does on one invocation.
#[derive(Clone, Debug)]
pub enum MockStep {
    Return(HandlerOutcome),
    Panic(String),
    /// Sleep before returning the outcome.
    Delay(Duration, HandlerOutcome),
}

/// Handler that replays a script of outcomes and records every payload.
///
/// Once the script runs out the default outcome is returned.
#[derive(Clone)]
pub struct MockHandler {
    dispatches: Arc<Mutex<Vec<serde_json::Value>>>,
    script: Arc<Mutex<VecDeque<MockStep>>>,
    default: Arc<Mutex<HandlerOutcome>>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::with_result(HandlerOutcome::Success)
    }

    pub fn with_result(result: HandlerOutcome) -> Self {
        Self {
            dispatches: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default: Arc::new(Mutex::new(result)),
        }
    }

    /// Queue steps to run before falling back to the default outcome.
    pub fn with_script(self, steps: impl IntoIterator<Item = MockStep>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    pub fn push(&self, step: MockStep) {
        self.script.lock().push_back(step);
    }

    pub fn set_result(&self, result: HandlerOutcome) {
        *self.default.lock() = result;
    }

    pub fn record(&self) -> Vec<serde_json::Value> {
        self.dispatches.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.lock().len()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatch_count();
        assert_eq!(
            actual, expected,
            "Expected {} dispatches, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        self.dispatches.lock().clear();
    }
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHandler")
            .field("dispatches", &self.dispatch_count())
            .field("scripted", &self.script.lock().len())
            .finish()
    }
}

#[async_trait]
impl JobHandler for MockHandler {
    async fn execute(&self, payload: &serde_json::Value) -> HandlerOutcome {
        self.dispatches.lock().push(payload.clone());
        let step = self.script.lock().pop_front();

        match step {
            Some(MockStep::Return(outcome)) => outcome,
            Some(MockStep::Panic(message)) => panic!("{message}"),
            Some(MockStep::Delay(delay, outcome)) => {
                tokio::time::sleep(delay).await;
                outcome
            }
            None => self.default.lock().clone(),
        }
    }
}
