//! Per-dependency circuit breakers.
//!
//! Each external dependency (for example `klaviyo_api`) owns one
//! [`CircuitBreakerState`] row. Every transition is a pure function on that
//! row; [`CircuitBreakerRegistry`] applies it with a load, decide,
//! compare-and-swap loop against a [`BreakerStore`], so workers in separate
//! processes never race a half-open trial.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::telemetry;

/// Compare-and-swap attempts before a transition gives up.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Breaker position.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreakerState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half_open" => Ok(BreakerState::HalfOpen),
            other => Err(EngineError::InvalidColumn {
                column: "state",
                value: other.to_string(),
            }),
        }
    }
}

/// Breaker thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker blocks before allowing a trial.
    pub recovery_timeout_secs: u64,
    /// Seconds a half-open trial reservation stays outstanding without an outcome.
    pub trial_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            trial_timeout_secs: 300,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::seconds(self.recovery_timeout_secs as i64)
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::seconds(self.trial_timeout_secs as i64)
    }
}

/// Whether a dependency may receive work right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    /// Breaker closed.
    Allowed,
    /// Caller holds the single half-open trial reservation.
    Trial,
    /// Open, or half-open with a trial already outstanding.
    Blocked { until: Option<DateTime<Utc>> },
}

/// Persisted breaker row for one dependency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub dependency: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Set while open: when the next trial becomes possible.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set while a half-open trial is outstanding.
    pub trial_expires_at: Option<DateTime<Utc>>,
    /// Bumped on every stored change; the compare-and-swap token.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreakerState {
    /// A never-persisted closed breaker.
    pub fn new(dependency: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            dependency: dependency.into(),
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            last_success_at: None,
            next_attempt_at: None,
            trial_expires_at: None,
            version: 0,
            updated_at: now,
        }
    }

    fn trial_outstanding(&self, now: DateTime<Utc>) -> bool {
        self.trial_expires_at.is_some_and(|expires| expires > now)
    }

    /// Decide admission at `now`; returns the row to store when admission
    /// itself changes state (open to half-open, or a trial reservation).
    pub fn admit(
        &self,
        now: DateTime<Utc>,
        config: &BreakerConfig,
    ) -> (Admission, Option<Self>) {
        match self.state {
            BreakerState::Closed => (Admission::Allowed, None),
            BreakerState::Open => match self.next_attempt_at {
                Some(at) if now < at => (Admission::Blocked { until: Some(at) }, None),
                _ => {
                    let mut next = self.clone();
                    next.state = BreakerState::HalfOpen;
                    next.next_attempt_at = None;
                    next.trial_expires_at = Some(now + config.trial_timeout());
                    (Admission::Trial, Some(next))
                }
            },
            BreakerState::HalfOpen if self.trial_outstanding(now) => (
                Admission::Blocked {
                    until: self.trial_expires_at,
                },
                None,
            ),
            BreakerState::HalfOpen => {
                let mut next = self.clone();
                next.trial_expires_at = Some(now + config.trial_timeout());
                (Admission::Trial, Some(next))
            }
        }
    }

    /// Apply a successful call.
    pub fn record_success(&self, now: DateTime<Utc>) -> Option<Self> {
        match self.state {
            BreakerState::Closed if self.failure_count == 0 => None,
            BreakerState::Closed | BreakerState::HalfOpen => {
                let mut next = self.clone();
                next.state = BreakerState::Closed;
                next.failure_count = 0;
                next.next_attempt_at = None;
                next.trial_expires_at = None;
                next.last_success_at = Some(now);
                Some(next)
            }
            // recovery only happens through a half-open trial
            BreakerState::Open => {
                let mut next = self.clone();
                next.last_success_at = Some(now);
                Some(next)
            }
        }
    }

    /// Apply a failed call.
    pub fn record_failure(&self, now: DateTime<Utc>, config: &BreakerConfig) -> Self {
        let mut next = self.clone();
        next.failure_count = self.failure_count.saturating_add(1);
        next.last_failure_at = Some(now);

        match self.state {
            BreakerState::Closed if next.failure_count >= config.failure_threshold => {
                next.state = BreakerState::Open;
                next.next_attempt_at = Some(now + config.recovery_timeout());
            }
            BreakerState::Closed | BreakerState::Open => {}
            BreakerState::HalfOpen => {
                next.state = BreakerState::Open;
                next.next_attempt_at = Some(now + config.recovery_timeout());
                next.trial_expires_at = None;
            }
        }
        next
    }

    /// Tie an outstanding trial reservation to the trial lease, expiring with
    /// it at `until`.
    pub fn hold_trial(&self, until: DateTime<Utc>, now: DateTime<Utc>) -> Option<Self> {
        if self.state != BreakerState::HalfOpen
            || !self.trial_outstanding(now)
            || self.trial_expires_at == Some(until)
        {
            return None;
        }
        let mut next = self.clone();
        next.trial_expires_at = Some(until);
        Some(next)
    }

    /// Drop an unused half-open trial reservation.
    pub fn release_trial(&self) -> Option<Self> {
        if self.state != BreakerState::HalfOpen || self.trial_expires_at.is_none() {
            return None;
        }
        let mut next = self.clone();
        next.trial_expires_at = None;
        Some(next)
    }

    /// Operator reset back to closed.
    pub fn reset(&self) -> Option<Self> {
        if self.state == BreakerState::Closed && self.failure_count == 0 {
            return None;
        }
        let mut next = self.clone();
        next.state = BreakerState::Closed;
        next.failure_count = 0;
        next.next_attempt_at = None;
        next.trial_expires_at = None;
        Some(next)
    }
}

/// Read-only view returned to operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub recovery_timeout_secs: u64,
}

impl BreakerSnapshot {
    fn from_state(state: &CircuitBreakerState, config: &BreakerConfig) -> Self {
        Self {
            dependency: state.dependency.clone(),
            state: state.state,
            failure_count: state.failure_count,
            failure_threshold: config.failure_threshold,
            next_attempt_at: state.next_attempt_at,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            recovery_timeout_secs: config.recovery_timeout_secs,
        }
    }
}

/// Keyed breaker storage with compare-and-swap writes.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    /// Load the row for a dependency, if it was ever persisted.
    async fn load(&self, dependency: &str) -> anyhow::Result<Option<CircuitBreakerState>>;

    /// Store `next` only if the stored version still equals `expected_version`.
    ///
    /// `None` means the row must not exist yet. Returns false when another
    /// writer got there first.
    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: &CircuitBreakerState,
    ) -> anyhow::Result<bool>;

    /// All persisted rows.
    async fn list(&self) -> anyhow::Result<Vec<CircuitBreakerState>>;
}

/// Applies breaker transitions against a [`BreakerStore`].
#[derive(Debug)]
pub struct CircuitBreakerRegistry<S> {
    store: Arc<S>,
    config: BreakerConfig,
}

impl<S: BreakerStore> CircuitBreakerRegistry<S> {
    pub fn new(store: Arc<S>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Ask whether `dependency` may receive work at `now`.
    pub async fn admit(
        &self,
        dependency: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Admission> {
        let config = &self.config;
        let (admission, _) = self
            .transition(dependency, now, |current| current.admit(now, config))
            .await?;
        Ok(admission)
    }

    pub async fn record_success(
        &self,
        dependency: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BreakerState> {
        let (_, state) = self
            .transition(dependency, now, |current| ((), current.record_success(now)))
            .await?;
        Ok(state.state)
    }

    pub async fn record_failure(
        &self,
        dependency: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BreakerState> {
        let config = &self.config;
        let (_, state) = self
            .transition(dependency, now, |current| {
                ((), Some(current.record_failure(now, config)))
            })
            .await?;
        Ok(state.state)
    }

    /// Give back a trial reservation that did not receive an item.
    pub async fn release_trial(
        &self,
        dependency: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.transition(dependency, now, |current| ((), current.release_trial()))
            .await?;
        Ok(())
    }

    /// Keep the trial reservation alive until the trial lease expires.
    pub async fn hold_trial(
        &self,
        dependency: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.transition(dependency, now, |current| ((), current.hold_trial(until, now)))
            .await?;
        Ok(())
    }

    /// Force a breaker back to closed.
    pub async fn reset(
        &self,
        dependency: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BreakerSnapshot> {
        let (_, state) = self
            .transition(dependency, now, |current| ((), current.reset()))
            .await?;
        info!(dependency, "circuit breaker reset");
        Ok(BreakerSnapshot::from_state(&state, &self.config))
    }

    /// Current state of one dependency; unknown dependencies read as closed.
    pub async fn snapshot(
        &self,
        dependency: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BreakerSnapshot> {
        let state = self
            .store
            .load(dependency)
            .await?
            .unwrap_or_else(|| CircuitBreakerState::new(dependency, now));
        Ok(BreakerSnapshot::from_state(&state, &self.config))
    }

    pub async fn snapshots(&self) -> anyhow::Result<Vec<BreakerSnapshot>> {
        let mut states = self.store.list().await?;
        states.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        Ok(states
            .iter()
            .map(|state| BreakerSnapshot::from_state(state, &self.config))
            .collect())
    }

    async fn transition<T, F>(
        &self,
        dependency: &str,
        now: DateTime<Utc>,
        decide: F,
    ) -> anyhow::Result<(T, CircuitBreakerState)>
    where
        F: Fn(&CircuitBreakerState) -> (T, Option<CircuitBreakerState>) + Send,
        T: Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let stored = self.store.load(dependency).await?;
            let expected = stored.as_ref().map(|state| state.version);
            let current =
                stored.unwrap_or_else(|| CircuitBreakerState::new(dependency, now));

            let (result, next) = decide(&current);
            let Some(mut next) = next else {
                return Ok((result, current));
            };
            next.version = current.version + 1;
            next.updated_at = now;

            if self.store.compare_and_swap(expected, &next).await? {
                if next.state != current.state {
                    telemetry::record_breaker_transition(
                        dependency,
                        current.state.as_str(),
                        next.state.as_str(),
                        next.failure_count,
                    );
                }
                return Ok((result, next));
            }

            debug!(dependency, attempt, "breaker compare-and-swap lost, retrying");
        }

        warn!(dependency, "breaker update abandoned after repeated contention");
        Err(EngineError::BreakerContention {
            dependency: dependency.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }
}
