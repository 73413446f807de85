//! Centi-second time base. Everything in the crate that measures or
//! schedules time does so in centi-seconds from an arbitrary monotonic
//! origin, with wrapping comparisons so the origin never matters.

use std::time::Instant;

/// A monotonic centi-second timestamp.
pub type Ticks = u32;

/// Signed difference `a - b` between two timestamps, tolerant of wrap.
pub fn ticks_since(a: Ticks, b: Ticks) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Source of the current time. Supplied at engine construction so tests
/// can drive schedules deterministically.
pub trait Clock {
    fn now(&self) -> Ticks;
}

/// The std monotonic clock.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> MonotonicClock {
        MonotonicClock::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Ticks {
        let elapsed = self.origin.elapsed();
        (elapsed.as_secs() * 100 + u64::from(elapsed.subsec_millis() / 10)) as Ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_since_handles_wrap() {
        assert_eq!(ticks_since(5, 3), 2);
        assert_eq!(ticks_since(3, 5), -2);
        assert_eq!(ticks_since(2, u32::max_value()), 3);
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(ticks_since(b, a) >= 0);
    }
}
