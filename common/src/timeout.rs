use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A monotonic time source. Readings are offsets from an arbitrary origin fixed at creation.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to. Used to drive timeouts deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: Duration) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}

/// A deadline measured on a [`Clock`]. It holds no reference to the clock, so it can be stored
/// next to the state it guards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeout {
    start: Duration,
    duration: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(clock: &dyn Clock, duration: Duration) -> Self {
        Self {
            start: clock.now(),
            duration,
        }
    }

    /// The clock reading at which this timeout expires.
    #[inline]
    pub fn deadline(&self) -> Duration {
        self.start + self.duration
    }

    #[inline]
    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.now() >= self.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_timeout() {
        let clock = ManualClock::new();
        clock.set(Duration::from_secs(1));
        let timeout = Timeout::new(&clock, Duration::from_millis(100));
        assert_eq!(timeout.deadline(), Duration::from_millis(1100));
        assert!(!timeout.expired(&clock));

        clock.advance(Duration::from_millis(99));
        assert!(!timeout.expired(&clock));

        clock.advance(Duration::from_millis(1));
        assert!(timeout.expired(&clock));
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
