//! Time source used by the launch wait and by backends that emulate timeouts

use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of time and sleeping
pub trait Clock: Send + Sync + Debug {
    /// Current instant
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually driven clock for deterministic tests
///
/// `sleep` advances virtual time by the requested amount and only pauses the
/// real thread briefly so other threads can run.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    elapsed: Mutex<Duration>,
}

/// Real time spent in each [`ManualClock::sleep`]
const MANUAL_SLEEP_YIELD: Duration = Duration::from_micros(50);

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Move virtual time forward
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
    }

    /// Virtual time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        std::thread::sleep(MANUAL_SLEEP_YIELD);
    }
}
