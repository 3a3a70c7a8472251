//! Clock abstraction so time-paced producers (file playback) can run on
//! virtual time in tests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock implementation used in production.
#[derive(Default)]
pub struct RealClock;

impl RealClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instead of blocking.
pub struct TestClock {
    current: Mutex<Instant>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.current.lock().unwrap();
        *now += duration;
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

pub fn real_clock() -> SharedClock {
    Arc::new(RealClock::new())
}

pub fn test_clock() -> Arc<TestClock> {
    Arc::new(TestClock::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_clock_tracks_wall_time() {
        let clock = RealClock::new();
        let before = Instant::now();
        assert!(clock.now() >= before);
    }

    #[test]
    fn test_clock_sleep_advances_virtual_time() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.sleep(Duration::from_secs(3));
        assert_eq!(clock.now().duration_since(t0), Duration::from_secs(3));
    }

    #[test]
    fn test_clock_advance_accumulates() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(200));
        clock.advance(Duration::from_millis(300));
        assert_eq!(clock.now().duration_since(t0), Duration::from_millis(500));
    }
}
