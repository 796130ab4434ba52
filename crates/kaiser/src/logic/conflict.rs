//! Conflict Manager: priority locks on `(deviceId, gpio)` actuator resources
//! with TTL and safety pre-emption. Grounded on the teacher's
//! `Mutex<HashMap<..>>` resource-tracking idiom (`main.rs`'s
//! `valve_opened_at: Mutex<HashMap<String, Instant>>`), generalized from a
//! single open-timestamp map into a full lock-with-holder-and-priority map.

use std::collections::HashMap;
use std::sync::Mutex;

use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

pub type ResourceKey = (String, i64);

struct Lock {
    rule_id: i64,
    priority: i64,
    safety: bool,
    expires_at: OffsetDateTime,
    cancel: CancellationToken,
}

pub enum AcquireOutcome {
    Granted,
    Blocked,
    /// The previous holder's cancellation token was fired; its id is
    /// returned so the caller can log the pre-emption.
    Preempted { previous_rule_id: i64 },
}

pub struct ConflictManager {
    locks: Mutex<HashMap<ResourceKey, Lock>>,
    ttl: Duration,
}

impl ConflictManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Attempt to acquire `resource` for `rule_id`. Grants when the
    /// resource is free, when the requester already holds it, or when the
    /// requester's priority is numerically strictly less than the holder's
    /// (lower number = higher priority, per spec.md §3). Equal priority is
    /// first-come: the existing holder keeps the lock. A `safety`-flagged
    /// request always pre-empts a non-safety holder regardless of priority.
    pub fn acquire(
        &self,
        clock: &dyn Clock,
        resource: ResourceKey,
        rule_id: i64,
        priority: i64,
        safety: bool,
    ) -> (AcquireOutcome, CancellationToken) {
        let mut locks = self.locks.lock().unwrap();
        let now = clock.now();

        if let Some(existing) = locks.get(&resource) {
            if existing.expires_at > now && existing.rule_id != rule_id {
                let can_preempt = (safety && !existing.safety) || priority < existing.priority;
                if !can_preempt {
                    return (AcquireOutcome::Blocked, CancellationToken::new());
                }
                let previous = existing.rule_id;
                let previous_cancel = existing.cancel.clone();
                previous_cancel.cancel();
                let token = CancellationToken::new();
                locks.insert(
                    resource,
                    Lock {
                        rule_id,
                        priority,
                        safety,
                        expires_at: now + self.ttl,
                        cancel: token.clone(),
                    },
                );
                return (AcquireOutcome::Preempted { previous_rule_id: previous }, token);
            }
        }

        let token = CancellationToken::new();
        locks.insert(
            resource,
            Lock {
                rule_id,
                priority,
                safety,
                expires_at: now + self.ttl,
                cancel: token.clone(),
            },
        );
        (AcquireOutcome::Granted, token)
    }

    pub fn release(&self, resource: &ResourceKey, rule_id: i64) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(existing) = locks.get(resource) {
            if existing.rule_id == rule_id {
                locks.remove(resource);
            }
        }
    }

    /// Drop expired locks. Intended to be called from the Scheduler.
    pub fn sweep(&self, clock: &dyn Clock) {
        let now = clock.now();
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, lock| lock.expires_at > now);
    }
}
