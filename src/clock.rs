use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Monotonic time source used by every protocol timer.
///
/// Timestamps are fractional seconds from an arbitrary epoch. The trait exists
/// so tests can drive virtual time instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// [`Clock`] backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Manually stepped clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward by `secs`.
    pub fn advance(&self, secs: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
