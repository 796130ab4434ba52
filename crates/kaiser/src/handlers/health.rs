//! Device health state machine (spec.md §4.7's read side) and the periodic
//! offline sweep, invoked by the Scheduler every 180s. Grounded on teacher
//! `main.rs`'s heartbeat-monitor task, generalized from one hardcoded
//! watchdog loop into a reusable derivation function plus a sweep.

use serde_json::json;
use tracing::info;

use crate::clock::Clock;
use crate::db::{AuditEntry, AuditSeverity};
use crate::handlers::HandlerContext;

const HEARTBEAT_INTERVAL_SEC: i64 = 60;

/// 180s, per spec.md §4.7's explicit adoption. The spec also quotes a 120s
/// figure elsewhere that is never otherwise used; that number is not this
/// constant and should not be substituted in.
pub const OFFLINE_THRESHOLD_SEC: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Online,
    Warning,
    Offline,
}

impl DeviceHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceHealth::Online => "online",
            DeviceHealth::Warning => "warning",
            DeviceHealth::Offline => "offline",
        }
    }
}

/// Derives online state from `lastSeen` age, per spec.md §4.7.
pub fn derive(last_seen: i64, now: i64) -> DeviceHealth {
    let age = now - last_seen;
    if age < 2 * HEARTBEAT_INTERVAL_SEC {
        DeviceHealth::Online
    } else if age < OFFLINE_THRESHOLD_SEC {
        DeviceHealth::Warning
    } else {
        DeviceHealth::Offline
    }
}

/// Scans every registered device and emits `esp_offline` transitions +
/// audit entries for devices that crossed into `Offline` without a new
/// heartbeat. Intended to be called from the Scheduler every ~180s.
pub async fn sweep(ctx: &HandlerContext) {
    let devices = match ctx.db.load_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!(error = %e, "device health sweep: failed to load devices");
            return;
        }
    };

    let now = ctx.clock.unix();
    for device in devices {
        let health = derive(device.last_seen, now);
        if health == DeviceHealth::Offline && device.status != "offline" {
            if let Err(e) = ctx.db.set_device_status(&device.device_id, "offline").await {
                tracing::warn!(error = %e, device_id = %device.device_id, "failed to mark device offline");
                continue;
            }
            info!(device_id = %device.device_id, "device transitioned to offline");
            ctx.ws.broadcast(
                "esp_status",
                json!({"esp_id": device.device_id, "status": "offline"}),
            );
            crate::audit::record(
                &ctx.db,
                &ctx.ws,
                AuditEntry {
                    timestamp: ctx.clock.unix(),
                    event_type: "esp_offline".to_string(),
                    device_id: Some(device.device_id.clone()),
                    gpio: None,
                    severity: AuditSeverity::Warning,
                    details: json!({"espId": device.device_id, "lastSeen": device.last_seen}),
                },
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_online_within_two_heartbeat_intervals() {
        assert_eq!(derive(1000, 1000 + 119), DeviceHealth::Online);
    }

    #[test]
    fn derives_warning_between_thresholds() {
        assert_eq!(derive(1000, 1000 + 150), DeviceHealth::Warning);
    }

    #[test]
    fn derives_offline_past_180s() {
        assert_eq!(derive(1000, 1000 + 181), DeviceHealth::Offline);
    }

    #[tokio::test]
    async fn sweep_marks_stale_device_offline_and_audits() {
        use crate::breaker::{BreakerConfig, CircuitBreaker};
        use crate::clock::MockClock;
        use crate::db::Db;
        use crate::logic::engine::LogicEngine;
        use crate::mqtt::KaiserMqtt;
        use crate::response_waiter::ResponseWaiterRegistry;
        use crate::ws::WsManager;
        use std::sync::Arc;
        use time::macros::datetime;

        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_device("ESP_STALE", None, "god").await.unwrap();
        db.record_heartbeat("ESP_STALE", 1_700_000_000, None, None).await.unwrap();

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
        let mut rx = ws.broadcast_rx_for_test();
        let clock = Arc::new(MockClock::new(datetime!(2024-01-01 00:00:00 UTC)));
        clock.advance(time::Duration::seconds(1_700_000_200 - clock.unix()));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let logic = Arc::new(LogicEngine::new(db.clone(), mqtt.clone(), ws.clone(), clock_dyn.clone(), 100, 20, response_waiters.clone()));

        let ctx = HandlerContext {
            db: db.clone(),
            mqtt,
            ws,
            clock: clock_dyn,
            processors: Arc::new(crate::processors::ProcessorRegistry::build()),
            logic,
            response_waiters,
            db_breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        };

        sweep(&ctx).await;

        let device = db.get_device_by_external_id("ESP_STALE").await.unwrap().unwrap();
        assert_eq!(device.status, "offline");

        let mut saw_status = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == "esp_status" {
                saw_status = true;
            }
        }
        assert!(saw_status, "expected an esp_status broadcast for the offline transition");
    }
}
