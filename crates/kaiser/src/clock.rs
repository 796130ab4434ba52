//! Injectable time source so cooldowns, rate windows, and breaker timers are
//! deterministic under test.

use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;

    fn unix(&self) -> i64 {
        self.now().unix_timestamp()
    }
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Test clock, advanced explicitly with [`MockClock::advance`]/[`MockClock::set`].
#[derive(Clone)]
pub struct MockClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl MockClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, t: OffsetDateTime) {
        *self.now.lock().unwrap() = t;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances() {
        let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let clock = MockClock::new(start);
        assert_eq!(clock.unix(), 1_700_000_000);
        clock.advance(time::Duration::seconds(90));
        assert_eq!(clock.unix(), 1_700_000_090);
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.unix();
        let b = clock.unix();
        assert!(b >= a);
    }
}
