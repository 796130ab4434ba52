//! Sensor Data Handler (spec.md §4.5), the hardest single piece: validate,
//! persist, optionally run the sensor through a Pi-Enhanced processor,
//! broadcast, and kick off logic evaluation — all without ever propagating
//! a hard failure back to the dispatcher. Grounded on teacher `main.rs`'s
//! `handle_telemetry`.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::KaiserError;
use crate::handlers::HandlerContext;
use crate::mqtt::TopicCategory;
use crate::topic::InboundTopic;

#[derive(Debug, Deserialize)]
struct SensorPayload {
    ts: i64,
    esp_id: String,
    gpio: i64,
    sensor_type: Value,
    raw: Option<f64>,
    #[serde(default)]
    raw_mode: bool,
    value: Option<f64>,
    unit: Option<String>,
    quality: Option<String>,
    #[serde(default)]
    zone_id: Option<String>,
    #[serde(default)]
    subzone_id: Option<String>,
}

/// Normalises a unix timestamp that may be given in seconds or
/// milliseconds, per spec.md §4.5's "magnitude heuristic" (values above
/// 10^11 are treated as milliseconds).
fn normalize_timestamp(ts: i64) -> i64 {
    if ts > 100_000_000_000 {
        ts / 1000
    } else {
        ts
    }
}

/// Entry point invoked by the dispatcher for every message matching
/// `kaiser/+/esp/+/sensor/+/data`. Never returns an `Err` the dispatcher
/// needs to act on beyond counting it as a failure — every failure mode
/// named in spec.md §4.5 is already handled and audited inline.
pub async fn handle(ctx: &HandlerContext, topic: &InboundTopic, body: &[u8]) -> Result<(), KaiserError> {
    // step 1: parse topic
    let (topic_device_id, topic_gpio) = match topic {
        InboundTopic::SensorData { device_id, gpio } => (device_id.clone(), *gpio),
        other => {
            warn!(?other, "sensor handler invoked with a non-sensor-data topic");
            return Err(KaiserError::Validation("wrong handler dispatched for topic".into()));
        }
    };

    // step 2: validate payload
    let payload: SensorPayload = serde_json::from_slice(body).map_err(|e| {
        KaiserError::Validation(format!("INVALID_PAYLOAD_FORMAT: {e}"))
    })?;
    if !payload.sensor_type.is_string() {
        return Err(KaiserError::Validation("INVALID_SENSOR_TYPE: sensor_type must be a string".into()));
    }
    let sensor_type = payload.sensor_type.as_str().unwrap().to_string();
    if payload.esp_id != topic_device_id || payload.gpio != topic_gpio {
        return Err(KaiserError::Validation(format!(
            "topic/payload device or gpio mismatch: topic=({topic_device_id}, {topic_gpio}) payload=({}, {})",
            payload.esp_id, payload.gpio
        )));
    }
    if payload.raw_mode && payload.raw.is_none() {
        return Err(KaiserError::Validation("INVALID_PAYLOAD_FORMAT: raw is required when raw_mode is set".into()));
    }
    let timestamp = normalize_timestamp(payload.ts);

    // step 3: DB circuit breaker
    if !ctx.db_breaker.allow_request() {
        let err = KaiserError::DbUnavailable;
        crate::audit::record_error(&ctx.db, &ctx.ws, ctx.clock.as_ref(), &err, Some(topic_device_id), Some(topic_gpio)).await;
        return Ok(());
    }

    // step 4: look up sensor config
    let sensor_config = match ctx.db.get_sensor_config(&topic_device_id, topic_gpio).await {
        Ok(cfg) => {
            ctx.db_breaker.record_success();
            cfg
        }
        Err(e) => {
            ctx.db_breaker.record_failure();
            warn!(error = %e, device_id = %topic_device_id, gpio = topic_gpio, "sensor config lookup failed");
            None
        }
    };

    let raw_value = payload.raw.or(payload.value).unwrap_or(0.0);
    let mut processed_value = payload.value;
    let mut unit = payload.unit.clone();
    let mut quality = payload.quality.clone().unwrap_or_else(|| "unknown".to_string());
    let mut metadata: Option<Value> = None;

    // step 5: Pi-Enhanced processing
    let pi_enhanced = sensor_config.as_ref().map(|c| c.pi_enhanced).unwrap_or(false);
    if pi_enhanced && payload.raw_mode {
        let cfg = sensor_config.as_ref().unwrap();
        let normalized_type = ctx.processors.normalize_owned(&sensor_type);
        match ctx.processors.get(&normalized_type) {
            Some(processor) => {
                let params = processor.default_params();
                match processor.process(raw_value, &cfg.calibration, &params) {
                    Ok(result) if result.quality == "error" => {
                        // Processor ran but flagged the reading itself as
                        // faulty (e.g. DS18B20's -127 sentinel): per spec.md
                        // §4.5 step 5 this is a processor failure, not a
                        // value to persist — null it out and audit it the
                        // same way a processor `Err` would be.
                        processed_value = None;
                        unit = Some(result.unit);
                        quality = result.quality;
                        metadata = Some(result.metadata.clone());

                        let reason = result
                            .metadata
                            .get("fault")
                            .and_then(|v| v.as_str())
                            .unwrap_or("processor reported quality=error")
                            .to_string();
                        let err = KaiserError::ProcessorFailure { sensor_type: normalized_type, reason };
                        crate::audit::record_error(&ctx.db, &ctx.ws, ctx.clock.as_ref(), &err, Some(topic_device_id.clone()), Some(topic_gpio)).await;
                    }
                    Ok(result) => {
                        processed_value = Some(result.value);
                        unit = Some(result.unit);
                        quality = result.quality;
                        metadata = Some(result.metadata);

                        let processed_topic = ctx.mqtt.codec.build_sensor_processed(&topic_device_id, topic_gpio);
                        let out = json!({
                            "espId": topic_device_id,
                            "gpio": topic_gpio,
                            "sensorType": normalized_type,
                            "value": result.value,
                            "unit": unit,
                            "quality": quality,
                            "timestamp": timestamp,
                        });
                        if let Ok(body) = serde_json::to_vec(&out) {
                            ctx.mqtt.publish(&processed_topic, TopicCategory::Other, body, false).await;
                        }
                    }
                    Err(reason) => {
                        quality = "error".to_string();
                        let err = KaiserError::ProcessorFailure {
                            sensor_type: normalized_type,
                            reason,
                        };
                        crate::audit::record_error(&ctx.db, &ctx.ws, ctx.clock.as_ref(), &err, Some(topic_device_id.clone()), Some(topic_gpio)).await;
                    }
                }
            }
            None => {
                quality = "error".to_string();
                let err = KaiserError::ProcessorMissing(normalized_type);
                crate::audit::record_error(&ctx.db, &ctx.ws, ctx.clock.as_ref(), &err, Some(topic_device_id.clone()), Some(topic_gpio)).await;
            }
        }
    }

    let error_code = if quality == "error" { Some("PROCESSOR_ERROR") } else { None };

    // step 6: persist (idempotent on device_id/gpio/timestamp)
    if let Err(e) = ctx
        .db
        .insert_reading(
            &topic_device_id,
            topic_gpio,
            raw_value,
            processed_value,
            unit.as_deref(),
            &quality,
            timestamp,
            "production",
            error_code,
        )
        .await
    {
        warn!(error = %e, device_id = %topic_device_id, gpio = topic_gpio, "failed to persist sensor reading");
        let err = KaiserError::Validation(format!("failed to persist reading: {e}"));
        crate::audit::record_error(&ctx.db, &ctx.ws, ctx.clock.as_ref(), &err, Some(topic_device_id.clone()), Some(topic_gpio)).await;
        return Ok(());
    }

    // step 7: WebSocket broadcast (never fails the pipeline)
    ctx.ws.broadcast(
        "sensor_data",
        json!({
            "esp_id": topic_device_id,
            "gpio": topic_gpio,
            "sensorType": sensor_type,
            "value": processed_value.unwrap_or(raw_value),
            "rawValue": raw_value,
            "unit": unit,
            "quality": quality,
            "metadata": metadata,
            "zoneId": payload.zone_id,
            "subzoneId": payload.subzone_id,
            "timestamp": timestamp,
        }),
    );

    // step 8: fire logic evaluation as a detached background task
    let logic = ctx.logic.clone();
    let device_id = topic_device_id.clone();
    let sensor_type_for_logic = sensor_type.clone();
    let value = processed_value.unwrap_or(raw_value);
    tokio::spawn(async move {
        logic.evaluate_sensor_data(&device_id, topic_gpio, &sensor_type_for_logic, value).await;
    });

    // step 9: return
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::clock::SystemClock;
    use crate::db::{Db, SensorConfig};
    use crate::logic::engine::LogicEngine;
    use crate::mqtt::KaiserMqtt;
    use crate::response_waiter::ResponseWaiterRegistry;
    use crate::ws::WsManager;
    use std::sync::Arc;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn mqtt_for_test() -> KaiserMqtt {
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
        mqtt
    }

    async fn context(db: Db) -> HandlerContext {
        let response_waiters = Arc::new(ResponseWaiterRegistry::new());
        let ws = WsManager::new();
        let mqtt = mqtt_for_test();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let logic = Arc::new(LogicEngine::new(
            db.clone(),
            mqtt.clone(),
            ws.clone(),
            clock.clone(),
            100,
            20,
            response_waiters.clone(),
        ));
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

    #[test]
    fn timestamp_heuristic_detects_milliseconds() {
        assert_eq!(normalize_timestamp(1_700_000_000), 1_700_000_000);
        assert_eq!(normalize_timestamp(1_700_000_000_123), 1_700_000_000);
    }

    #[tokio::test]
    async fn raw_mode_without_raw_is_rejected() {
        let db = memory_db().await;
        let ctx = context(db).await;
        let topic = InboundTopic::SensorData { device_id: "ESP_1".into(), gpio: 4 };
        let body = json!({
            "ts": 1_700_000_000, "esp_id": "ESP_1", "gpio": 4,
            "sensor_type": "ds18b20", "raw_mode": true,
        })
        .to_string();
        let err = handle(&ctx, &topic, body.as_bytes()).await.unwrap_err();
        assert!(matches!(err, KaiserError::Validation(_)));
    }

    #[tokio::test]
    async fn topic_payload_mismatch_is_rejected() {
        let db = memory_db().await;
        let ctx = context(db).await;
        let topic = InboundTopic::SensorData { device_id: "ESP_1".into(), gpio: 4 };
        let body = json!({
            "ts": 1_700_000_000, "esp_id": "ESP_OTHER", "gpio": 4,
            "sensor_type": "ds18b20", "value": 21.5,
        })
        .to_string();
        let err = handle(&ctx, &topic, body.as_bytes()).await.unwrap_err();
        assert!(matches!(err, KaiserError::Validation(_)));
    }

    #[tokio::test]
    async fn non_enhanced_sensor_persists_without_processor() {
        let db = memory_db().await;
        db.upsert_device("ESP_1", None, "god").await.unwrap();
        db.upsert_sensor_config(&SensorConfig {
            id: 0,
            device_id: "ESP_1".into(),
            gpio: 4,
            sensor_type: "ds18b20".into(),
            name: "probe".into(),
            enabled: true,
            pi_enhanced: false,
            operating_mode: "normal".into(),
            interval_ms: 5000,
            timeout_sec: 30,
            calibration: json!({}),
            threshold_min: None,
            threshold_max: None,
            threshold_warn: None,
        })
        .await
        .unwrap();
        let ctx = context(db.clone()).await;
        let topic = InboundTopic::SensorData { device_id: "ESP_1".into(), gpio: 4 };
        let body = json!({
            "ts": 1_700_000_000, "esp_id": "ESP_1", "gpio": 4,
            "sensor_type": "ds18b20", "value": 21.5, "quality": "good",
        })
        .to_string();
        handle(&ctx, &topic, body.as_bytes()).await.unwrap();

        let rows = db.list_readings(Some("ESP_1"), Some(4), 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].processed_value, Some(21.5));
    }

    #[tokio::test]
    async fn pi_enhanced_raw_mode_runs_processor_and_persists_processed_value() {
        let db = memory_db().await;
        db.upsert_device("ESP_1", None, "god").await.unwrap();
        db.upsert_sensor_config(&SensorConfig {
            id: 0,
            device_id: "ESP_1".into(),
            gpio: 4,
            sensor_type: "ds18b20".into(),
            name: "probe".into(),
            enabled: true,
            pi_enhanced: true,
            operating_mode: "normal".into(),
            interval_ms: 5000,
            timeout_sec: 30,
            calibration: json!({}),
            threshold_min: None,
            threshold_max: None,
            threshold_warn: None,
        })
        .await
        .unwrap();
        let ctx = context(db.clone()).await;
        let topic = InboundTopic::SensorData { device_id: "ESP_1".into(), gpio: 4 };
        let body = json!({
            "ts": 1_700_000_000, "esp_id": "ESP_1", "gpio": 4,
            "sensor_type": "ds18b20", "raw": 21.5, "raw_mode": true,
        })
        .to_string();
        handle(&ctx, &topic, body.as_bytes()).await.unwrap();

        let rows = db.list_readings(Some("ESP_1"), Some(4), 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].processed_value.is_some());
        assert_ne!(rows[0].quality, "error");
    }

    #[tokio::test]
    async fn unknown_processor_marks_quality_error_but_still_persists() {
        let db = memory_db().await;
        db.upsert_device("ESP_1", None, "god").await.unwrap();
        db.upsert_sensor_config(&SensorConfig {
            id: 0,
            device_id: "ESP_1".into(),
            gpio: 9,
            sensor_type: "exotic_quantum_sensor".into(),
            name: "mystery".into(),
            enabled: true,
            pi_enhanced: true,
            operating_mode: "normal".into(),
            interval_ms: 5000,
            timeout_sec: 30,
            calibration: json!({}),
            threshold_min: None,
            threshold_max: None,
            threshold_warn: None,
        })
        .await
        .unwrap();
        let ctx = context(db.clone()).await;
        let topic = InboundTopic::SensorData { device_id: "ESP_1".into(), gpio: 9 };
        let body = json!({
            "ts": 1_700_000_000, "esp_id": "ESP_1", "gpio": 9,
            "sensor_type": "exotic_quantum_sensor", "raw": 1.0, "raw_mode": true,
        })
        .to_string();
        handle(&ctx, &topic, body.as_bytes()).await.unwrap();

        let rows = db.list_readings(Some("ESP_1"), Some(9), 10, 0).await.unwrap();
        assert_eq!(rows[0].quality, "error");
        assert!(rows[0].processed_value.is_none());
    }

    #[tokio::test]
    async fn no_sensor_config_persists_with_unknown_quality() {
        let db = memory_db().await;
        db.upsert_device("ESP_1", None, "god").await.unwrap();
        let ctx = context(db.clone()).await;
        let topic = InboundTopic::SensorData { device_id: "ESP_1".into(), gpio: 7 };
        let body = json!({
            "ts": 1_700_000_000, "esp_id": "ESP_1", "gpio": 7,
            "sensor_type": "ds18b20", "value": 18.0,
        })
        .to_string();
        handle(&ctx, &topic, body.as_bytes()).await.unwrap();

        let rows = db.list_readings(Some("ESP_1"), Some(7), 10, 0).await.unwrap();
        assert_eq!(rows[0].quality, "unknown");
    }

    #[tokio::test]
    async fn open_db_breaker_drops_reading_without_error() {
        let db = memory_db().await;
        let mut ctx = context(db.clone()).await;
        ctx.db_breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout: std::time::Duration::from_secs(600),
            half_open_max_calls: 1,
        }));
        ctx.db_breaker.record_failure();
        assert!(!ctx.db_breaker.allow_request());

        let topic = InboundTopic::SensorData { device_id: "ESP_1".into(), gpio: 4 };
        let body = json!({
            "ts": 1_700_000_000, "esp_id": "ESP_1", "gpio": 4,
            "sensor_type": "ds18b20", "value": 21.5,
        })
        .to_string();
        handle(&ctx, &topic, body.as_bytes()).await.unwrap();

        let rows = db.list_readings(Some("ESP_1"), Some(4), 10, 0).await.unwrap();
        assert!(rows.is_empty(), "reading should have been dropped while the breaker is open");
    }

}
