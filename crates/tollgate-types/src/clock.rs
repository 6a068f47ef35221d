//! Time source abstraction.
//!
//! Components never read the wall clock directly; they hold an
//! `Arc<dyn Clock>` so tests can drive time deterministically:
//! - **Production**: [`SystemClock`] reads wall-clock time and really sleeps
//! - **Tests**: [`ManualClock`] advances only when told to, and `sleep`
//!   advances instead of blocking, so retry backoff runs instantly

use std::{sync::RwLock, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};

/// Time source used by every component.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Blocks the calling thread for `duration`.
    ///
    /// Delivery backoff goes through this method rather than
    /// `std::thread::sleep` so simulated clocks can skip real waiting.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time source for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually driven clock for tests.
///
/// Shared via `Arc`; all interior mutation goes through `&self` so the same
/// handle can sit inside several components at once.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock pinned at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.write().expect("lock poisoned");
        *now += delta;
    }

    /// Jumps the clock to `instant`.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.write().expect("lock poisoned");
        *now = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().expect("lock poisoned")
    }

    fn sleep(&self, duration: Duration) {
        // Durations beyond chrono's range are not meaningful here.
        self.advance(TimeDelta::from_std(duration).unwrap_or_default());
    }
}
