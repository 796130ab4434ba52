//! Actuator status/response/alert handlers (spec.md §4.4's handler
//! catalogue), generalized from teacher `main.rs`'s `handle_valve_command`
//! (valve-only) into the actuator-generic equivalent. `response` additionally
//! resolves any [`crate::response_waiter::ResponseWaiterRegistry`] entry the
//! Logic Engine is waiting on for that `request_id`.

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::db::ActuatorState;
use crate::error::KaiserError;
use crate::handlers::HandlerContext;
use crate::topic::InboundTopic;

#[derive(Debug, Deserialize)]
struct ActuatorStatusPayload {
    #[serde(default)]
    state: bool,
    #[serde(default)]
    pwm_value: f64,
    #[serde(default)]
    emergency_state: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ActuatorResponsePayload {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    emergency_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActuatorAlertPayload {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

pub async fn handle_status(ctx: &HandlerContext, topic: &InboundTopic, body: &[u8]) -> Result<(), KaiserError> {
    let (device_id, gpio) = match topic {
        InboundTopic::ActuatorStatus { device_id, gpio } => (device_id.clone(), *gpio),
        other => {
            warn!(?other, "actuator status handler invoked with wrong topic");
            return Err(KaiserError::Validation("wrong handler dispatched for topic".into()));
        }
    };
    let payload: ActuatorStatusPayload = serde_json::from_slice(body)
        .map_err(|e| KaiserError::Validation(format!("INVALID_PAYLOAD_FORMAT: {e}")))?;

    ctx.db
        .upsert_actuator_state(&ActuatorState {
            device_id: device_id.clone(),
            gpio,
            state: payload.state,
            pwm_value: payload.pwm_value,
            last_command_ts: payload.ts,
            emergency_state: payload.emergency_state.unwrap_or_else(|| "normal".to_string()),
        })
        .await
        .map_err(|e| KaiserError::Validation(format!("actuator state update failed: {e}")))?;

    ctx.ws.broadcast(
        "actuator_status",
        json!({"esp_id": device_id, "gpio": gpio, "state": payload.state, "pwmValue": payload.pwm_value}),
    );
    Ok(())
}

pub async fn handle_response(ctx: &HandlerContext, topic: &InboundTopic, body: &[u8]) -> Result<(), KaiserError> {
    let (device_id, gpio) = match topic {
        InboundTopic::ActuatorResponse { device_id, gpio } => (device_id.clone(), *gpio),
        other => {
            warn!(?other, "actuator response handler invoked with wrong topic");
            return Err(KaiserError::Validation("wrong handler dispatched for topic".into()));
        }
    };
    let payload: ActuatorResponsePayload = serde_json::from_slice(body)
        .map_err(|e| KaiserError::Validation(format!("INVALID_PAYLOAD_FORMAT: {e}")))?;

    if let Some(request_id) = &payload.request_id {
        let resolved = ctx.response_waiters.resolve(
            request_id,
            json!({"success": payload.success, "message": payload.message}),
        );
        if !resolved {
            tracing::debug!(request_id, "actuator response arrived with no matching waiter (already timed out?)");
        }
    }

    // `emergencyState` is part of the normative response payload (spec.md
    // §3/§6.2) and updates the same row `handle_status` owns; preserve the
    // existing state/pwm_value rather than clobbering them.
    if let Some(emergency_state) = &payload.emergency_state {
        let existing = ctx.db.get_actuator_state(&device_id, gpio).await.ok().flatten();
        let (state, pwm_value, last_command_ts) = match existing {
            Some(s) => (s.state, s.pwm_value, s.last_command_ts),
            None => (false, 0.0, None),
        };
        if let Err(e) = ctx
            .db
            .upsert_actuator_state(&ActuatorState {
                device_id: device_id.clone(),
                gpio,
                state,
                pwm_value,
                last_command_ts,
                emergency_state: emergency_state.clone(),
            })
            .await
        {
            warn!(error = %e, device_id = %device_id, gpio, "failed to apply emergency_state from actuator response");
        }
    }

    ctx.ws.broadcast(
        "actuator_response",
        json!({"esp_id": device_id, "gpio": gpio, "success": payload.success, "message": payload.message}),
    );
    Ok(())
}

pub async fn handle_alert(ctx: &HandlerContext, topic: &InboundTopic, body: &[u8]) -> Result<(), KaiserError> {
    let (device_id, gpio) = match topic {
        InboundTopic::ActuatorAlert { device_id, gpio } => (device_id.clone(), *gpio),
        other => {
            warn!(?other, "actuator alert handler invoked with wrong topic");
            return Err(KaiserError::Validation("wrong handler dispatched for topic".into()));
        }
    };
    let payload: ActuatorAlertPayload = serde_json::from_slice(body)
        .map_err(|e| KaiserError::Validation(format!("INVALID_PAYLOAD_FORMAT: {e}")))?;

    crate::audit::record_system(
        &ctx.db,
        &ctx.ws,
        ctx.clock.as_ref(),
        "actuator_alert",
        json!({"espId": device_id, "gpio": gpio, "reason": payload.reason, "details": payload.details}),
    )
    .await;
    ctx.ws.broadcast("actuator_alert", json!({"esp_id": device_id, "gpio": gpio}));
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
            processors: Arc::new(crate::processors::ProcessorRegistry::build()),
            logic,
            response_waiters,
            db_breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        }
    }

    #[tokio::test]
    async fn status_update_persists_and_broadcasts() {
        let ctx = context().await;
        let topic = InboundTopic::ActuatorStatus { device_id: "ESP_1".into(), gpio: 16 };
        let body = json!({"state": true, "pwm_value": 75.0}).to_string();
        handle_status(&ctx, &topic, body.as_bytes()).await.unwrap();

        let state = ctx.db.get_actuator_state("ESP_1", 16).await.unwrap().unwrap();
        assert!(state.state);
        assert_eq!(state.pwm_value, 75.0);
    }

    #[tokio::test]
    async fn response_resolves_a_waiting_request() {
        let ctx = context().await;
        let rx = ctx.response_waiters.register("req-123");
        let topic = InboundTopic::ActuatorResponse { device_id: "ESP_1".into(), gpio: 16 };
        let body = json!({"request_id": "req-123", "success": true}).to_string();
        handle_response(&ctx, &topic, body.as_bytes()).await.unwrap();

        let payload = rx.await.unwrap();
        assert_eq!(payload["success"], true);
    }

    #[tokio::test]
    async fn response_with_emergency_state_updates_actuator_state() {
        let ctx = context().await;
        let topic = InboundTopic::ActuatorResponse { device_id: "ESP_1".into(), gpio: 16 };
        let body = json!({"success": true, "emergency_state": "active"}).to_string();
        handle_response(&ctx, &topic, body.as_bytes()).await.unwrap();

        let state = ctx.db.get_actuator_state("ESP_1", 16).await.unwrap().unwrap();
        assert_eq!(state.emergency_state, "active");
    }

    #[tokio::test]
    async fn response_without_emergency_state_does_not_create_a_row() {
        let ctx = context().await;
        let topic = InboundTopic::ActuatorResponse { device_id: "ESP_1".into(), gpio: 16 };
        let body = json!({"success": true}).to_string();
        handle_response(&ctx, &topic, body.as_bytes()).await.unwrap();

        assert!(ctx.db.get_actuator_state("ESP_1", 16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn alert_is_audited_and_broadcast() {
        let ctx = context().await;
        let mut rx = ctx.ws.broadcast_rx_for_test();
        let topic = InboundTopic::ActuatorAlert { device_id: "ESP_1".into(), gpio: 16 };
        let body = json!({"reason": "overcurrent"}).to_string();
        handle_alert(&ctx, &topic, body.as_bytes()).await.unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type, "audit_event");
        let second = rx.try_recv().unwrap();
        assert_eq!(second.event_type, "actuator_alert");
    }
}
