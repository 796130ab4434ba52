//! Heartbeat Handler (spec.md §4.7 steps 1-4). The read-side online-state
//! derivation and the offline sweep live in [`crate::handlers::health`].
//! Grounded on teacher `main.rs`'s `handle_node_status`.

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::KaiserError;
use crate::handlers::HandlerContext;
use crate::topic::InboundTopic;

#[derive(Debug, Deserialize)]
struct HeartbeatPayload {
    ts: i64,
    #[serde(default)]
    uptime: Option<i64>,
    heap_free: Option<i64>,
    wifi_rssi: Option<i64>,
    #[serde(default)]
    sensor_count: Option<i64>,
    #[serde(default)]
    actuator_count: Option<i64>,
    #[serde(default)]
    state: Option<String>,
}

pub async fn handle(ctx: &HandlerContext, topic: &InboundTopic, body: &[u8]) -> Result<(), KaiserError> {
    let device_id = match topic {
        InboundTopic::Heartbeat { device_id } => device_id.clone(),
        other => {
            warn!(?other, "heartbeat handler invoked with a non-heartbeat topic");
            return Err(KaiserError::Validation("wrong handler dispatched for topic".into()));
        }
    };

    let payload: HeartbeatPayload = serde_json::from_slice(body)
        .map_err(|e| KaiserError::Validation(format!("INVALID_PAYLOAD_FORMAT: {e}")))?;

    // step 2: auto-registration is disabled — unknown devices are dropped.
    let updated = ctx
        .db
        .record_heartbeat(&device_id, payload.ts, payload.heap_free, payload.wifi_rssi)
        .await
        .map_err(|e| KaiserError::Validation(format!("heartbeat update failed: {e}")))?;

    if !updated {
        let err = KaiserError::UnknownDevice(device_id.clone());
        crate::audit::record_error(&ctx.db, &ctx.ws, ctx.clock.as_ref(), &err, Some(device_id), None).await;
        return Ok(());
    }

    // step 4: broadcast esp_health
    ctx.ws.broadcast(
        "esp_health",
        json!({
            "esp_id": device_id,
            "uptime": payload.uptime,
            "heapFree": payload.heap_free,
            "wifiRssi": payload.wifi_rssi,
            "sensorCount": payload.sensor_count,
            "actuatorCount": payload.actuator_count,
            "state": payload.state,
            "timestamp": payload.ts,
        }),
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::clock::{Clock, SystemClock};
    use crate::db::Db;
    use crate::logic::engine::LogicEngine;
    use crate::mqtt::KaiserMqtt;
    use crate::response_waiter::ResponseWaiterRegistry;
    use crate::ws::WsManager;
    use std::sync::Arc;

    async fn context(db: Db) -> HandlerContext {
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
            processors: Arc::new(crate::processors::ProcessorRegistry::build()),
            logic,
            response_waiters,
            db_breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        }
    }

    #[tokio::test]
    async fn known_device_heartbeat_updates_and_broadcasts() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_device("ESP_1", None, "god").await.unwrap();
        let ctx = context(db.clone()).await;
        let mut rx = ctx.ws.broadcast_rx_for_test();

        let topic = InboundTopic::Heartbeat { device_id: "ESP_1".into() };
        let body = json!({"ts": 1_700_000_000, "heap_free": 32000, "wifi_rssi": -55}).to_string();
        handle(&ctx, &topic, body.as_bytes()).await.unwrap();

        let device = db.get_device_by_external_id("ESP_1").await.unwrap().unwrap();
        assert_eq!(device.last_seen, 1_700_000_000);
        assert_eq!(device.status, "online");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "esp_health");
    }

    #[tokio::test]
    async fn unknown_device_heartbeat_is_dropped_and_audited() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let ctx = context(db.clone()).await;
        let mut rx = ctx.ws.broadcast_rx_for_test();

        let topic = InboundTopic::Heartbeat { device_id: "ESP_GHOST".into() };
        let body = json!({"ts": 1_700_000_000}).to_string();
        handle(&ctx, &topic, body.as_bytes()).await.unwrap();

        assert!(db.get_device_by_external_id("ESP_GHOST").await.unwrap().is_none());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "audit_event");
        assert_eq!(event.data["eventType"], "unknown_device");
    }
}
