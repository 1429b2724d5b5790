//! Monotonic clock and duration primitives shared by the flowgate crates.
//!
//! [`Duration`] is an immutable microsecond-precision value type; [`Timer`]
//! wraps [`std::time::Instant`] to produce one at a measurement boundary.
//! Everything else in the workspace talks in terms of these two types
//! instead of reaching for `std::time` directly, so that a single place
//! controls the precision and the round-trip guarantees tested below.

use std::time::Instant;

/// An immutable span of time, stored as whole microseconds.
///
/// `Duration` values never panic on construction; overflow saturates at
/// [`i64::MAX`]/[`i64::MIN`] rather than wrapping, since a saturated
/// duration is still a safe (if wrong) value to feed into a timeout,
/// while a wrapped negative duration is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration {
    micros: i64,
}

impl Duration {
    /// The zero duration.
    pub const ZERO: Duration = Duration { micros: 0 };

    /// Builds a duration from a whole number of nanoseconds (truncated to
    /// the nearest microsecond).
    #[must_use]
    pub const fn from_nanos(nanos: i64) -> Self {
        Duration {
            micros: nanos / 1_000,
        }
    }

    /// Builds a duration from a whole number of microseconds.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Duration { micros }
    }

    /// Builds a duration from a whole number of milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Duration {
            micros: millis.saturating_mul(1_000),
        }
    }

    /// Builds a duration from a whole number of seconds.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Duration {
            micros: secs.saturating_mul(1_000_000),
        }
    }

    /// Returns the duration as whole microseconds.
    #[must_use]
    pub const fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Returns the duration as whole milliseconds (truncated).
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.micros / 1_000
    }

    /// Returns the duration as whole seconds (truncated).
    #[must_use]
    pub const fn as_secs(&self) -> i64 {
        self.micros / 1_000_000
    }

    /// Returns the duration in fractional seconds, for use in histograms.
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.micros as f64 / 1_000_000.0
    }

    /// True if this duration is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.micros == 0
    }
}

impl std::ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration {
            micros: self.micros.saturating_add(rhs.micros),
        }
    }
}

impl std::ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration {
            micros: self.micros.saturating_sub(rhs.micros),
        }
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Duration {
            micros: d.as_micros().min(i64::MAX as u128) as i64,
        }
    }
}

impl From<Duration> for std::time::Duration {
    /// Negative durations clamp to zero: `std::time::Duration` cannot be
    /// negative, and none of the flowgate crates construct a negative
    /// timeout on purpose.
    fn from(d: Duration) -> Self {
        std::time::Duration::from_micros(d.micros.max(0) as u64)
    }
}

/// A single monotonic measurement boundary.
///
/// `Timer::start` captures "now"; `Timer::elapsed` reports the
/// [`Duration`] since that capture. Kept as its own type (rather than
/// exposing `std::time::Instant` on every public API) so call sites never
/// have to import `std::time` themselves.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started_at: Instant,
}

impl Timer {
    /// Starts a new timer at the current instant.
    #[must_use]
    pub fn start() -> Self {
        Timer {
            started_at: Instant::now(),
        }
    }

    /// Returns the duration elapsed since [`Timer::start`] was called.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from(self.started_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        assert_eq!(Duration::from_millis(250).as_millis(), 250);
    }

    #[test]
    fn nanos_round_trip_to_micros() {
        assert_eq!(Duration::from_nanos(5_500_000).as_micros(), 5_500_000 / 1_000);
    }

    #[test]
    fn zero_is_singleton_value() {
        assert_eq!(Duration::ZERO, Duration::from_micros(0));
        assert!(Duration::ZERO.is_zero());
    }

    #[test]
    fn seconds_equals_micros_over_1e6() {
        let d = Duration::from_secs(7);
        assert_eq!(d.as_secs(), d.as_micros() / 1_000_000);
    }

    #[test]
    fn timer_elapsed_is_nonnegative() {
        let t = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(t.elapsed().as_micros() > 0);
    }

    proptest::proptest! {
        #[test]
        fn millis_round_trip_prop(ms in 0i64..1_000_000_000) {
            proptest::prop_assert_eq!(Duration::from_millis(ms).as_millis(), ms);
        }

        #[test]
        fn nanos_to_micros_prop(ns in 0i64..1_000_000_000) {
            proptest::prop_assert_eq!(Duration::from_nanos(ns).as_micros(), ns / 1_000);
        }
    }
}
