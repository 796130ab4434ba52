//! Subscriber & Dispatch (spec.md §4.4): routes raw `(topic, payload)`
//! callbacks from the MQTT event loop to the matching handler, behind a
//! bounded worker pool. Grounded on teacher `main.rs`'s single
//! `match`-on-topic block in its event loop, generalized from a hardcoded
//! `if topic == ...` chain into dispatch over [`InboundTopic`] with
//! per-handler success/failure counters.
//!
//! Ordering is best-effort across devices; the pipeline is idempotent on
//! `(deviceId, gpio, timestamp)` so the spec explicitly allows a single
//! shared worker pool instead of a per-device keyed queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::KaiserError;
use crate::handlers::{actuator, heartbeat, sensor, HandlerContext};
use crate::topic::InboundTopic;

/// Default bounded worker pool size, per spec.md §4.4 step 3.
pub const DEFAULT_MAX_WORKERS: usize = 10;

#[derive(Debug, Default, Clone, Copy)]
pub struct HandlerCounts {
    pub success: u64,
    pub failure: u64,
}

#[derive(Default)]
struct Counters {
    inner: Mutex<HashMap<&'static str, (AtomicU64, AtomicU64)>>,
}

impl Counters {
    fn record(&self, label: &'static str, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(label).or_insert_with(|| (AtomicU64::new(0), AtomicU64::new(0)));
        if ok {
            entry.0.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.1.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> HashMap<&'static str, HandlerCounts> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(label, (ok, err))| {
                (
                    *label,
                    HandlerCounts {
                        success: ok.load(Ordering::Relaxed),
                        failure: err.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

/// Routes `(topic, payload)` pairs onto a bounded pool of `ctx` clones.
/// `HandlerContext` is cheap to clone (everything inside is an `Arc` or a
/// pooled connection handle), so each dispatched worker gets its own clone
/// rather than shared behind a lock.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: HandlerContext,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(ctx: HandlerContext, max_workers: usize) -> Self {
        Self {
            ctx,
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn counters(&self) -> HashMap<&'static str, HandlerCounts> {
        self.counters.snapshot()
    }

    /// Step 1+2: parse the topic, then submit to the worker pool (step 3).
    /// Payload JSON validity is each handler's own responsibility (step 1 of
    /// spec.md's algorithm is "parse payload as JSON", which every handler
    /// already does via `serde_json::from_slice` before touching the DB).
    pub async fn dispatch(&self, topic: &str, payload: Vec<u8>) {
        let parsed = match self.ctx.mqtt.parse_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(topic, error = %e, "dispatch: unrecognized topic, dropping");
                crate::audit::record_error(&self.ctx.db, &self.ctx.ws, self.ctx.clock.as_ref(), &e, None, None).await;
                return;
            }
        };

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let ctx = self.ctx.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let label = handler_label(&parsed);
            let result = route(&ctx, &parsed, &payload).await;
            match result {
                Ok(()) => counters.record(label, true),
                Err(e) => {
                    counters.record(label, false);
                    warn!(topic = label, error = %e, "handler failed");
                    crate::audit::record_error(&ctx.db, &ctx.ws, ctx.clock.as_ref(), &e, None, None).await;
                }
            }
        });
    }

    #[cfg(test)]
    pub async fn dispatch_and_wait(&self, topic: &str, payload: Vec<u8>) {
        self.dispatch(topic, payload).await;
        // Give the spawned worker a chance to run before the caller asserts.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

fn handler_label(topic: &InboundTopic) -> &'static str {
    match topic {
        InboundTopic::SensorData { .. } => "sensor_data",
        InboundTopic::ActuatorStatus { .. } => "actuator_status",
        InboundTopic::ActuatorResponse { .. } => "actuator_response",
        InboundTopic::ActuatorAlert { .. } => "actuator_alert",
        InboundTopic::Heartbeat { .. } => "heartbeat",
        InboundTopic::Diagnostics { .. } => "diagnostics",
        InboundTopic::ConfigResponse { .. } => "config_response",
        InboundTopic::ZoneAck { .. } => "zone_ack",
        InboundTopic::SubzoneAck { .. } => "subzone_ack",
        InboundTopic::Lwt { .. } => "lwt",
    }
}

/// First-match-wins routing over the [`InboundTopic`] catalogue (spec.md
/// §4.4 step 2 — the enum variant itself already encodes "first registered
/// pattern that matches", since `TopicCodec::parse` only ever returns one
/// variant per topic shape).
async fn route(ctx: &HandlerContext, topic: &InboundTopic, payload: &[u8]) -> Result<(), KaiserError> {
    match topic {
        InboundTopic::SensorData { .. } => sensor::handle(ctx, topic, payload).await,
        InboundTopic::Heartbeat { .. } => heartbeat::handle(ctx, topic, payload).await,
        InboundTopic::ActuatorStatus { .. } => actuator::handle_status(ctx, topic, payload).await,
        InboundTopic::ActuatorResponse { .. } => actuator::handle_response(ctx, topic, payload).await,
        InboundTopic::ActuatorAlert { .. } => actuator::handle_alert(ctx, topic, payload).await,
        InboundTopic::Diagnostics { device_id } => {
            tracing::debug!(device_id, "diagnostics message received (logged only)");
            Ok(())
        }
        InboundTopic::ConfigResponse { device_id } => {
            ctx.ws.broadcast("config_ack", serde_json::json!({"esp_id": device_id}));
            Ok(())
        }
        InboundTopic::ZoneAck { device_id } => {
            ctx.ws.broadcast("zone_ack", serde_json::json!({"esp_id": device_id}));
            Ok(())
        }
        InboundTopic::SubzoneAck { device_id } => {
            ctx.ws.broadcast("subzone_ack", serde_json::json!({"esp_id": device_id}));
            Ok(())
        }
        InboundTopic::Lwt { device_id } => {
            if let Err(e) = ctx.db.set_device_status(device_id, "offline").await {
                return Err(KaiserError::Validation(format!("failed to mark {device_id} offline on LWT: {e}")));
            }
            ctx.ws.broadcast("esp_status", serde_json::json!({"esp_id": device_id, "status": "offline"}));
            crate::audit::record_system(
                &ctx.db,
                &ctx.ws,
                ctx.clock.as_ref(),
                "esp_lwt",
                serde_json::json!({"espId": device_id}),
            )
            .await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::clock::{Clock, SystemClock};
    use crate::db::Db;
    use crate::logic::engine::LogicEngine;
    use crate::mqtt::KaiserMqtt;
    use crate::processors::ProcessorRegistry;
    use crate::response_waiter::ResponseWaiterRegistry;
    use crate::ws::WsManager;

    async fn context() -> HandlerContext {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        std::env::set_var("MQTT_HOST", "127.0.0.1");
        std::env::set_var("MQTT_PORT", "1");
        let (mqtt, mut eventloop) = KaiserMqtt::connect("god", 64).unwrap();
        tokio::spawn(async move {
            loop {
                if eventloop.poll().await.is_err() {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        });
        let response_waiters = Arc::new(ResponseWaiterRegistry::new());
        let ws = WsManager::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let logic = Arc::new(LogicEngine::new(db.clone(), mqtt.clone(), ws.clone(), clock.clone(), 100, 20, response_waiters.clone()));
        HandlerContext {
            db,
            mqtt,
            ws,
            clock,
            processors: Arc::new(ProcessorRegistry::build()),
            logic,
            response_waiters,
            db_breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        }
    }

    #[tokio::test]
    async fn unrecognized_topic_is_dropped_and_audited() {
        let ctx = context().await;
        let dispatcher = Dispatcher::new(ctx.clone(), 4);
        let mut rx = ctx.ws.broadcast_rx_for_test();

        dispatcher.dispatch_and_wait("kaiser/god/esp/E1/bogus", b"{}".to_vec()).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "audit_event");
    }

    #[tokio::test]
    async fn lwt_marks_device_offline_and_counts_success() {
        let ctx = context().await;
        ctx.db.upsert_device("ESP_1", None, "god").await.unwrap();
        let dispatcher = Dispatcher::new(ctx.clone(), 4);

        dispatcher.dispatch_and_wait("kaiser/god/esp/ESP_1/lwt", b"{}".to_vec()).await;

        let device = ctx.db.get_device_by_external_id("ESP_1").await.unwrap().unwrap();
        assert_eq!(device.status, "offline");
        assert_eq!(dispatcher.counters()["lwt"].success, 1);
    }

    #[tokio::test]
    async fn handler_failure_is_counted_and_audited() {
        let ctx = context().await;
        let dispatcher = Dispatcher::new(ctx.clone(), 4);
        let mut rx = ctx.ws.broadcast_rx_for_test();

        // Heartbeat handler rejects malformed JSON.
        dispatcher
            .dispatch_and_wait("kaiser/god/esp/ESP_1/system/heartbeat", b"not json".to_vec())
            .await;

        assert_eq!(dispatcher.counters()["heartbeat"].failure, 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "audit_event");
    }
}
