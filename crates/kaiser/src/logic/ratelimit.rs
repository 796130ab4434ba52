//! Sliding-window rate limiting: three independent tiers (global, per-device,
//! per-rule) plus the WebSocket manager's per-client limiter reuse the same
//! primitive. Grounded on the teacher's `DailyCounters` style of per-key
//! counters (`db.rs`'s `zone_daily_counters`), generalized from a persisted
//! daily counter into an in-memory sliding window keyed by an arbitrary
//! string.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use time::{Duration, OffsetDateTime};

use crate::clock::Clock;

/// One sliding window per distinct key (e.g. a device id, a rule id, a
/// websocket client id).
pub struct SlidingWindowLimiter {
    window: Duration,
    budget: usize,
    hits: Mutex<HashMap<String, VecDeque<OffsetDateTime>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, budget: usize) -> Self {
        Self {
            window,
            budget,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `key` and report whether it's within budget.
    /// Rejected attempts are not recorded, so callers can retry without
    /// having to "give back" a slot.
    pub fn check(&self, clock: &dyn Clock, key: &str) -> bool {
        let now = clock.now();
        let mut hits = self.hits.lock().unwrap();
        let deque = hits.entry(key.to_string()).or_default();
        while let Some(front) = deque.front() {
            if now - *front > self.window {
                deque.pop_front();
            } else {
                break;
            }
        }
        if deque.len() >= self.budget {
            return false;
        }
        deque.push_back(now);
        true
    }

    pub fn current_count(&self, key: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(key)
            .map(|d| d.len())
            .unwrap_or(0)
    }
}

/// The engine's three-tier budget, per spec.md §4.8 step 2. `GLOBAL_KEY` is
/// a fixed key shared by every rule/device.
pub const GLOBAL_KEY: &str = "__global__";

pub struct EngineRateLimiter {
    pub global: SlidingWindowLimiter,
    pub per_device: SlidingWindowLimiter,
}

impl EngineRateLimiter {
    pub fn new(global_per_sec: usize, per_device_per_sec: usize) -> Self {
        Self {
            global: SlidingWindowLimiter::new(Duration::seconds(1), global_per_sec),
            per_device: SlidingWindowLimiter::new(Duration::seconds(1), per_device_per_sec),
        }
    }

    /// Per-rule budget uses the rule's own `maxExecutionsPerHour`, so it's
    /// checked against a caller-supplied limiter keyed by rule id rather
    /// than a fixed field here.
    pub fn allow(&self, clock: &dyn Clock, device_id: &str) -> bool {
        self.global.check(clock, GLOBAL_KEY) && self.per_device.check(clock, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use time::macros::datetime;

    #[test]
    fn allows_up_to_budget_then_blocks() {
        let clock = MockClock::new(datetime!(2024-01-01 00:00:00 UTC));
        let limiter = SlidingWindowLimiter::new(Duration::seconds(1), 2);
        assert!(limiter.check(&clock, "k"));
        assert!(limiter.check(&clock, "k"));
        assert!(!limiter.check(&clock, "k"));
    }

    #[test]
    fn window_slides_with_clock() {
        let clock = MockClock::new(datetime!(2024-01-01 00:00:00 UTC));
        let limiter = SlidingWindowLimiter::new(Duration::seconds(1), 1);
        assert!(limiter.check(&clock, "k"));
        assert!(!limiter.check(&clock, "k"));
        clock.advance(Duration::milliseconds(1100));
        assert!(limiter.check(&clock, "k"));
    }

    #[test]
    fn keys_are_independent() {
        let clock = MockClock::new(datetime!(2024-01-01 00:00:00 UTC));
        let limiter = SlidingWindowLimiter::new(Duration::seconds(1), 1);
        assert!(limiter.check(&clock, "a"));
        assert!(limiter.check(&clock, "b"));
    }

    #[test]
    fn engine_limiter_enforces_both_tiers() {
        let clock = MockClock::new(datetime!(2024-01-01 00:00:00 UTC));
        let engine = EngineRateLimiter::new(1, 5);
        assert!(engine.allow(&clock, "ESP_1"));
        assert!(!engine.allow(&clock, "ESP_2"), "global budget of 1 exhausted");
    }
}
