//! Periodic job host (spec.md §4.12). Generalizes the teacher's single
//! `tokio::time::interval` tick loop — originally dedicated to one
//! zone-watering decision — into several independently-ticking jobs sharing
//! one [`crate::handlers::HandlerContext`].
//!
//! Every job is a plain async function; `run` just owns the interval timers
//! and logs what it dispatches. Retention/cleanup is wired but stays
//! disabled unless explicitly turned on, per the Open Question resolution
//! recorded in DESIGN.md — it must never auto-enable itself.

use std::time::Duration;

use tracing::{info, warn};

use crate::handlers::health;
use crate::handlers::HandlerContext;

/// Device offline sweep cadence — matches [`health::OFFLINE_THRESHOLD_SEC`]
/// so a device can be caught within one sweep of crossing the threshold.
const DEVICE_SWEEP_INTERVAL_SEC: u64 = 180;

/// MQTT broker connectivity probe cadence.
const BROKER_PROBE_INTERVAL_SEC: u64 = 30;

/// Stale-sensor sweep cadence.
const STALE_SENSOR_INTERVAL_SEC: u64 = 300;

/// Timer-triggered rule evaluation + conflict-lock sweep cadence.
const RULE_TICK_INTERVAL_SEC: u64 = 60;

pub struct SchedulerConfig {
    pub retention_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retention_enabled: false,
        }
    }
}

/// Runs every scheduled job on its own ticker until the process shuts down.
/// Intended to be `tokio::spawn`-ed once from `main`.
pub async fn run(ctx: HandlerContext, config: SchedulerConfig) {
    let mut device_sweep = tokio::time::interval(Duration::from_secs(DEVICE_SWEEP_INTERVAL_SEC));
    let mut broker_probe = tokio::time::interval(Duration::from_secs(BROKER_PROBE_INTERVAL_SEC));
    let mut stale_sweep = tokio::time::interval(Duration::from_secs(STALE_SENSOR_INTERVAL_SEC));
    let mut rule_tick = tokio::time::interval(Duration::from_secs(RULE_TICK_INTERVAL_SEC));

    info!(
        device_sweep_sec = DEVICE_SWEEP_INTERVAL_SEC,
        broker_probe_sec = BROKER_PROBE_INTERVAL_SEC,
        stale_sweep_sec = STALE_SENSOR_INTERVAL_SEC,
        rule_tick_sec = RULE_TICK_INTERVAL_SEC,
        retention_enabled = config.retention_enabled,
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = device_sweep.tick() => {
                health::sweep(&ctx).await;
            }
            _ = broker_probe.tick() => {
                probe_broker(&ctx).await;
            }
            _ = stale_sweep.tick() => {
                sweep_stale_sensors(&ctx).await;
            }
            _ = rule_tick.tick() => {
                ctx.logic.evaluate_timers().await;
                ctx.logic.sweep_conflicts();
            }
        }
    }
}

/// Logs and audits a crossing of the MQTT circuit breaker out of `Closed`.
/// The breaker itself trips from publish failures observed elsewhere; this
/// job only reports the current state so an open breaker shows up even if
/// nothing happens to be publishing right now.
async fn probe_broker(ctx: &HandlerContext) {
    use crate::breaker::BreakerState;

    let state = ctx.mqtt.breaker_state();
    if state != BreakerState::Closed {
        warn!(?state, "mqtt circuit breaker is not closed");
        crate::audit::record_system(
            &ctx.db,
            &ctx.ws,
            ctx.clock.as_ref(),
            "mqtt_breaker_state",
            serde_json::json!({"state": format!("{state:?}")}),
        )
        .await;
    }
}

/// Marks sensors whose latest reading is older than their configured
/// `timeout_sec` as suspect, per spec.md §4.12. Readings themselves are an
/// immutable history; "suspect" is communicated live over the websocket
/// rather than rewritten into the stored row.
async fn sweep_stale_sensors(ctx: &HandlerContext) {
    let configs = match ctx.db.list_sensor_configs().await {
        Ok(configs) => configs,
        Err(e) => {
            warn!(error = %e, "stale sensor sweep: failed to load sensor configs");
            return;
        }
    };

    let now = ctx.clock.unix();
    for cfg in configs {
        let last_ts = match ctx.db.latest_reading_timestamp(&cfg.device_id, cfg.gpio).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, device_id = %cfg.device_id, gpio = cfg.gpio, "stale sensor sweep: failed to load latest reading");
                continue;
            }
        };

        let is_stale = match last_ts {
            None => true,
            Some(ts) => now - ts > cfg.timeout_sec,
        };

        if is_stale {
            ctx.ws.broadcast(
                "sensor_stale",
                serde_json::json!({
                    "espId": cfg.device_id,
                    "gpio": cfg.gpio,
                    "sensorType": cfg.sensor_type,
                    "lastSeen": last_ts,
                }),
            );
        }
    }
}
