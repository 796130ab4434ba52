//! Library entry point backing the `kaiser` binary. Split out of
//! `main.rs` so integration tests under `tests/` can exercise the real
//! modules (db, mqtt, logic engine, handlers, ws) the same way the
//! binary wires them up, without standing up a process.

pub mod audit;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod logic;
pub mod mqtt;
pub mod offline_buffer;
pub mod processors;
pub mod response_waiter;
pub mod scheduler;
pub mod topic;
pub mod web;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{Event, Packet};
use tracing::{error, info, warn};

use breaker::{BreakerConfig, CircuitBreaker};
use clock::{Clock, SystemClock};
use config::Settings;
use db::Db;
use dispatch::Dispatcher;
use handlers::HandlerContext;
use logic::engine::LogicEngine;
use mqtt::{KaiserMqtt, TopicCategory};
use processors::ProcessorRegistry;
use response_waiter::ResponseWaiterRegistry;
use web::AppState;
use ws::WsManager;

/// Runs the hub to completion (until a termination signal or a critical
/// task dies). Broken out of `main` so the binary stays a thin shim.
pub async fn run() -> Result<()> {
    let settings = Settings::from_env();
    info!(kaiser_id = %settings.kaiser_id, "starting");

    // ── Database ────────────────────────────────────────────────────
    // When using tmpfs the database file is lost on reboot. Restore from
    // the persistent backup (if one exists) before connecting.
    if let (Some(working_path), Some(ref backup)) =
        (db::db_file_path(&settings.db_url), &settings.db_backup_path)
    {
        match db::restore_from_backup(&working_path, backup) {
            Ok(true) => info!(backup = %backup, "database restored from backup"),
            Ok(false) => {}
            Err(e) => warn!("backup restore failed (starting fresh): {e:#}"),
        }
    }

    let db = Db::connect(&settings.db_url).await?;
    db.migrate().await?;

    // ── Config file (seed devices/sensors/actuators/rules) ───────────
    match config::load(&settings.config_path) {
        Ok(seed) => {
            if let Err(e) = config::apply(&seed, &db, &settings.kaiser_id).await {
                error!("applying config seed failed: {e:#}");
            }
        }
        Err(e) => warn!("no usable config file at {}: {e:#}", settings.config_path),
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let (mqtt, mut eventloop) = KaiserMqtt::connect(&settings.kaiser_id, settings.offline_buffer_capacity)?;
    mqtt.subscribe_all().await?;

    // ── Shared collaborators ──────────────────────────────────────────
    let ws = WsManager::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let response_waiters = Arc::new(ResponseWaiterRegistry::new());
    let processors_registry = Arc::new(ProcessorRegistry::build());
    let logic = Arc::new(LogicEngine::new(
        db.clone(),
        mqtt.clone(),
        ws.clone(),
        clock.clone(),
        settings.rate_limit_global_per_sec,
        settings.rate_limit_device_per_sec,
        response_waiters.clone(),
    ));
    let db_breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
        failure_threshold: settings.breaker_failure_threshold,
        reset_timeout: Duration::from_secs(settings.breaker_reset_timeout_sec),
        ..Default::default()
    }));

    let ctx = HandlerContext {
        db: db.clone(),
        mqtt: mqtt.clone(),
        ws: ws.clone(),
        clock: clock.clone(),
        processors: processors_registry,
        logic: logic.clone(),
        response_waiters,
        db_breaker,
    };

    let dispatcher = Dispatcher::new(ctx.clone(), settings.dispatch_workers);

    audit::record_system(
        &db,
        &ws,
        clock.as_ref(),
        "hub_started",
        serde_json::json!({"kaiserId": settings.kaiser_id}),
    )
    .await;

    // ── Web/WS server ──────────────────────────────────────────────────
    let app_state = AppState {
        db: db.clone(),
        mqtt: mqtt.clone(),
        ws: ws.clone(),
        dispatcher: dispatcher.clone(),
    };
    let web_port = settings.web_port;
    let mut web_handle = tokio::spawn(async move {
        web::serve(app_state, web_port).await;
    });

    // ── Scheduler ──────────────────────────────────────────────────────
    let mut scheduler_handle = {
        let sched_ctx = ctx.clone();
        let sched_config = scheduler::SchedulerConfig {
            retention_enabled: settings.retention_enabled,
        };
        tokio::spawn(async move {
            scheduler::run(sched_ctx, sched_config).await;
        })
    };

    // ── Periodic database backup (SD card wear mitigation) ─────────────
    let final_backup_dest = settings.db_backup_path.clone();
    let mut backup_handle = {
        let backup_db = db.clone();
        let backup_dest = settings.db_backup_path.clone();
        let backup_interval = settings.db_backup_interval_sec.unwrap_or(1800);
        tokio::spawn(async move {
            let Some(dest) = backup_dest else {
                // No backup path configured — park this task forever.
                std::future::pending::<()>().await;
                return;
            };
            info!(path = %dest, interval_sec = backup_interval, "database backup task started");

            tokio::time::sleep(Duration::from_secs(120)).await;

            let mut ticker = tokio::time::interval(Duration::from_secs(backup_interval));
            loop {
                ticker.tick().await;
                match backup_db.backup(&dest).await {
                    Ok(()) => info!(path = %dest, "database backup complete"),
                    Err(e) => error!("database backup failed: {e:#}"),
                }
            }
        })
    };

    // ── Signal handling ────────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // ── Main event loop ─────────────────────────────────────────────────
    let exit_reason: &str;

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        dispatcher.dispatch(&p.topic, p.payload.to_vec()).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        if let Err(e) = mqtt.subscribe_all().await {
                            error!("re-subscribe failed: {e}");
                        }
                        mqtt.replay_offline_buffer().await;
                        audit::record_system(&db, &ws, clock.as_ref(), "mqtt_connected", serde_json::json!({})).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                        audit::record_system(&db, &ws, clock.as_ref(), "mqtt_disconnected", serde_json::json!({})).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }

            // ── Critical task monitoring ────────────────────────────────
            result = &mut scheduler_handle => {
                error!("CRITICAL: scheduler task exited unexpectedly: {result:?}");
                exit_reason = "scheduler task died";
                break;
            }

            result = &mut web_handle => {
                error!("CRITICAL: web server task exited unexpectedly: {result:?}");
                exit_reason = "web task died";
                break;
            }

            result = &mut backup_handle => {
                error!("database backup task exited unexpectedly: {result:?}");
                // Not safety-critical; log and continue.
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown ────────────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down");
    audit::record_system(
        &db,
        &ws,
        clock.as_ref(),
        "hub_shutdown",
        serde_json::json!({"reason": exit_reason}),
    )
    .await;

    // Final database backup before exit.
    if let Some(dest) = &final_backup_dest {
        info!("performing final database backup");
        match db.backup(dest).await {
            Ok(()) => info!(path = %dest, "final database backup complete"),
            Err(e) => error!("final database backup failed: {e:#}"),
        }
    }

    // Best-effort retained offline announcement (LWT-equivalent) before exit.
    // `broadcast/emergency` is deliberately NOT fired here — shutting down
    // the hub is not a reason to force every actuator in the fleet off.
    let _ = mqtt
        .publish(&mqtt.codec.build_status(), TopicCategory::Other, b"offline".to_vec(), true)
        .await;

    info!("shutdown complete");
    Ok(())
}
