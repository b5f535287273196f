use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// Source of "now" for every scheduling and breaker decision.
///
/// Store operations receive timestamps from the clock instead of reading
/// the database clock, so recovery timeouts can be driven in tests.
pub trait Clock: Debug + Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
