//! Hub entry point: reads env/config, connects to MQTT and SQLite, wires up
//! the dispatcher, logic engine, scheduler, and web/WS server.
//!
//! Safety and durability features carried over from the teacher's hub:
//! - Signal handler: SIGTERM/SIGINT → retained offline status before exit
//! - MQTT re-subscribe on every reconnect, offline buffer replay on `ConnAck`
//! - Periodic SQLite backup (`VACUUM INTO`) + tmpfs-restore-on-boot
//! - Critical task monitoring: scheduler/web dying is fatal, non-critical
//!   tasks (backup) just log and keep the hub running

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    kaiser::run().await
}
