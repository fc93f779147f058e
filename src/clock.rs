//! Monotonic time source used for connect timeouts and download throttling.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Source of monotonic time in fractional seconds.
pub trait Clock {
    fn now_seconds(&self) -> f64;
}

/// Wall clock backed by [`Instant`], measured from construction.
#[derive(Debug)]
pub struct RealClock {
    epoch: Instant,
}

impl RealClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealClock {
    fn now_seconds(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Hand-advanced clock for deterministic tests.
///
/// Clones share the same underlying time cell, so a test can keep one handle
/// while installing the other on a channel.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        self.now.set(seconds);
    }

    pub fn advance(&self, seconds: f64) {
        self.now.set(self.now.get() + seconds);
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> f64 {
        self.now.get()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manual_clock_shares_time_across_clones() {
        let a = ManualClock::new();
        let b = a.clone();
        a.set(5.0);
        b.advance(1.5);
        assert_eq!(a.now_seconds(), 6.5);
    }

    #[test]
    fn real_clock_is_monotonic() {
        let c = RealClock::new();
        let t0 = c.now_seconds();
        let t1 = c.now_seconds();
        assert!(t1 >= t0);
    }
}
