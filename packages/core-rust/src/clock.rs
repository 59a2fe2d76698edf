//! Monotonic clock abstraction for latency measurement.
//!
//! All timing in this crate reads nanoseconds from a [`ClockSource`] rather
//! than calling `Instant::now()` directly, so that tests can drive time with
//! a [`ManualClock`] and assert exact durations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Abstraction over the monotonic clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a manual one.
/// The default implementation ([`MonotonicClock`]) delegates to
/// `std::time::Instant`.
///
/// Implementations must be monotonic (readings never decrease under normal
/// operation) and must never return zero: zero is reserved as the "timer not
/// running" sentinel in [`RequestContext`](crate::RequestContext).
pub trait ClockSource: Send + Sync {
    /// Returns the current monotonic time in nanoseconds. Never zero.
    fn now_nanos(&self) -> u64;
}

/// Default clock source backed by `std::time::Instant`.
///
/// Readings are nanoseconds elapsed since the clock was constructed, offset
/// by one so the zero sentinel is never produced.
#[derive(Debug)]
pub struct MonotonicClock {
    anchor: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        // +1 keeps the first reading away from the zero sentinel.
        #[allow(clippy::cast_possible_truncation)]
        let nanos = self.anchor.elapsed().as_nanos() as u64;
        nanos + 1
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Shared freely across threads; `advance` and `set` are atomic stores, so a
/// test can move time forward while worker threads read it.
#[derive(Debug)]
pub struct ManualClock {
    now_nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a clock at the given starting instant. Callers should start
    /// at a nonzero value; zero readings would collide with the idle-timer
    /// sentinel.
    #[must_use]
    pub fn new(start_nanos: u64) -> Self {
        Self {
            now_nanos: AtomicU64::new(start_nanos),
        }
    }

    /// Moves the clock forward by `nanos`.
    pub fn advance(&self, nanos: u64) {
        self.now_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute reading. Tests use this to simulate a
    /// clock going backward.
    pub fn set(&self, nanos: u64) {
        self.now_nanos.store(nanos, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now_nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_returns_zero() {
        let clock = MonotonicClock::new();
        assert!(clock.now_nanos() > 0);
    }

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now_nanos();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = clock.now_nanos();
        assert!(b > a);
    }

    #[test]
    fn manual_clock_advance_and_set() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_nanos(), 1_000);

        clock.advance(500);
        assert_eq!(clock.now_nanos(), 1_500);

        clock.set(100);
        assert_eq!(clock.now_nanos(), 100);
    }
}
