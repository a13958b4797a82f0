use crate::Timestamp;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

/// Source of the current time
///
/// Token expiry and transaction stamps read time through this seam so tests
/// can pin it.
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> Timestamp;
}

/// Real wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Settable clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Start at the given instant
    #[must_use]
    pub fn at(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock time
    #[must_use]
    pub fn starting_now() -> Self {
        Self::at(Utc::now())
    }

    /// Move the clock forward (or backward for a negative duration)
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: Timestamp) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}
