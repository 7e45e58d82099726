//! Time sources for rate limit evaluation.
//!
//! Strategies never read the time themselves; the admission layer samples its
//! clock once per evaluation and passes `now` down explicitly.

use parking_lot::RwLock;

/// A source of the current time as fractional epoch seconds.
pub trait Clock: Send + Sync {
    /// Current time in seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Wall clock with millisecond precision.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: RwLock<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` epoch seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: f64) {
        *self.now.write() = now;
    }

    /// Move forward by `secs` seconds.
    pub fn advance(&self, secs: f64) {
        *self.now.write() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now(), 100.0);

        clock.advance(1.5);
        assert_eq!(clock.now(), 101.5);

        clock.set(7.0);
        assert_eq!(clock.now(), 7.0);
    }

    #[test]
    fn test_system_clock_is_epoch_seconds() {
        let now = SystemClock.now();
        // Sometime after 2020-01-01.
        assert!(now > 1_577_836_800.0);
    }
}
