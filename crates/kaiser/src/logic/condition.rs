//! Condition tree: threshold leaves, time-window leaves, AND/OR internals.
//! New code (the teacher has no rule engine), grounded on the guard-clause
//! style of `scheduler::handle_idle`'s moisture/staleness checks — each leaf
//! here is the same kind of "is this number past a bound" test, generalized
//! to an arbitrary tree instead of one zone's fixed checks.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::db::Db;
use crate::error::KaiserError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
}

impl CompareOp {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lte => lhs <= rhs,
            CompareOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
            CompareOp::Neq => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Threshold {
        device_id: String,
        gpio: i64,
        sensor_type: String,
        op: CompareOp,
        value: f64,
    },
    /// `start_hour`/`end_hour` in 0..24; `start_hour > end_hour` wraps past
    /// midnight (e.g. 22..6 means 22:00-05:59). `days_of_week`: Mon=0..Sun=6.
    TimeWindow {
        start_hour: u8,
        end_hour: u8,
        days_of_week: Vec<u8>,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

/// The sensor event that triggered evaluation, if any — a threshold leaf
/// referring to the same `(deviceId, gpio, sensor_type)` reads its value
/// straight from here rather than re-querying the store.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub device_id: String,
    pub gpio: i64,
    pub sensor_type: String,
    pub value: f64,
}

pub fn evaluate<'a>(
    cond: &'a Condition,
    db: &'a Db,
    clock: &'a dyn Clock,
    trigger: Option<&'a TriggerEvent>,
) -> BoxFuture<'a, Result<bool, KaiserError>> {
    async move {
        match cond {
            Condition::Threshold {
                device_id,
                gpio,
                sensor_type,
                op,
                value,
            } => {
                let from_trigger = trigger.and_then(|t| {
                    if &t.device_id == device_id && t.gpio == *gpio && &t.sensor_type == sensor_type {
                        Some(t.value)
                    } else {
                        None
                    }
                });
                let observed = match from_trigger {
                    Some(v) => Some(v),
                    None => db
                        .latest_processed_value(device_id, *gpio)
                        .await
                        .map_err(|_| KaiserError::DbUnavailable)?,
                };
                Ok(observed.map(|v| op.apply(v, *value)).unwrap_or(false))
            }
            Condition::TimeWindow {
                start_hour,
                end_hour,
                days_of_week,
            } => {
                let now = clock.now();
                let hour = now.hour();
                let weekday = now.weekday().number_days_from_monday();
                let day_ok = days_of_week.contains(&weekday);
                let hour_ok = if start_hour <= end_hour {
                    hour >= *start_hour && hour < *end_hour
                } else {
                    hour >= *start_hour || hour < *end_hour
                };
                Ok(day_ok && hour_ok)
            }
            Condition::And(children) => {
                for c in children {
                    if !evaluate(c, db, clock, trigger).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(children) => {
                for c in children {
                    if evaluate(c, db, clock, trigger).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use time::macros::datetime;

    #[tokio::test]
    async fn threshold_reads_from_trigger_when_matching() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let clock = MockClock::new(datetime!(2024-01-01 00:00:00 UTC));

        let cond = Condition::Threshold {
            device_id: "ESP_1".into(),
            gpio: 34,
            sensor_type: "ph".into(),
            op: CompareOp::Gt,
            value: 7.5,
        };
        let trigger = TriggerEvent {
            device_id: "ESP_1".into(),
            gpio: 34,
            sensor_type: "ph".into(),
            value: 7.75,
        };
        assert!(evaluate(&cond, &db, &clock, Some(&trigger)).await.unwrap());
    }

    #[tokio::test]
    async fn threshold_false_with_no_data_and_no_trigger() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let clock = MockClock::new(datetime!(2024-01-01 00:00:00 UTC));
        let cond = Condition::Threshold {
            device_id: "ESP_1".into(),
            gpio: 34,
            sensor_type: "ph".into(),
            op: CompareOp::Gt,
            value: 7.5,
        };
        assert!(!evaluate(&cond, &db, &clock, None).await.unwrap());
    }

    #[tokio::test]
    async fn time_window_wraps_past_midnight() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let cond = Condition::TimeWindow {
            start_hour: 22,
            end_hour: 6,
            days_of_week: vec![0], // Monday
        };

        let clock = MockClock::new(datetime!(2024-01-01 23:00:00 UTC)); // Monday 23:00
        assert!(evaluate(&cond, &db, &clock, None).await.unwrap());

        let clock = MockClock::new(datetime!(2024-01-01 07:00:00 UTC)); // Monday 07:00
        assert!(!evaluate(&cond, &db, &clock, None).await.unwrap());
    }

    #[tokio::test]
    async fn and_short_circuits() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let clock = MockClock::new(datetime!(2024-01-01 00:00:00 UTC));

        let cond = Condition::And(vec![
            Condition::TimeWindow {
                start_hour: 1,
                end_hour: 2,
                days_of_week: vec![0, 1, 2, 3, 4, 5, 6],
            },
            Condition::TimeWindow {
                start_hour: 1,
                end_hour: 2,
                days_of_week: vec![0, 1, 2, 3, 4, 5, 6],
            },
        ]);
        assert!(!evaluate(&cond, &db, &clock, None).await.unwrap());
    }

    #[tokio::test]
    async fn or_true_if_any_child_true() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let clock = MockClock::new(datetime!(2024-01-01 00:00:00 UTC));

        let cond = Condition::Or(vec![
            Condition::TimeWindow {
                start_hour: 1,
                end_hour: 2,
                days_of_week: vec![],
            },
            Condition::TimeWindow {
                start_hour: 0,
                end_hour: 23,
                days_of_week: vec![0, 1, 2, 3, 4, 5, 6],
            },
        ]);
        assert!(evaluate(&cond, &db, &clock, None).await.unwrap());
    }
}
