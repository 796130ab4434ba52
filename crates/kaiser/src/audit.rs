//! Audit trail: every non-fatal error is both persisted and mirrored as an
//! `audit_event` on the WebSocket so operator UIs see it in real time
//! (spec.md §7, "Non-fatal errors mirrored as audit_event"). Grounded on the
//! teacher `state.rs`'s `SystemState::record_error`/`record_system` dual
//! effect (push into the in-memory ring *and* note it for the dashboard);
//! here the durable side is the `audit_log` table instead of an in-memory
//! ring, and the live side is the WebSocket Manager instead of a polled
//! status endpoint.

use serde_json::json;

use crate::clock::Clock;
use crate::db::{AuditEntry, AuditSeverity, Db};
use crate::error::KaiserError;
use crate::ws::WsManager;

/// Persist `entry` and broadcast it. Failure to persist is logged but never
/// propagated — the audit trail must not be able to fail a caller's own
/// operation.
pub async fn record(db: &Db, ws: &WsManager, entry: AuditEntry) {
    let data = json!({
        "eventType": entry.event_type,
        "deviceId": entry.device_id,
        "gpio": entry.gpio,
        "severity": entry.severity.as_str(),
        "details": entry.details,
        "timestamp": entry.timestamp,
    });

    if let Err(e) = db.append_audit(&entry).await {
        tracing::error!(error = %e, "failed to persist audit entry");
    }

    ws.broadcast("audit_event", data);
}

/// Convenience wrapper for the common case: a [`KaiserError`] encountered
/// while handling a device-scoped message. Severity and event type come
/// from the error itself (§7's policy table).
pub async fn record_error(
    db: &Db,
    ws: &WsManager,
    clock: &dyn Clock,
    err: &KaiserError,
    device_id: Option<String>,
    gpio: Option<i64>,
) {
    let entry = AuditEntry {
        timestamp: clock.unix(),
        event_type: err.event_type().to_string(),
        device_id,
        gpio,
        severity: err.severity(),
        details: json!({"message": err.to_string()}),
    };
    record(db, ws, entry).await;
}

/// Convenience wrapper for operational (non-error) system events, e.g.
/// startup/shutdown, matching the teacher's `record_system` counterpart.
pub async fn record_system(db: &Db, ws: &WsManager, clock: &dyn Clock, event_type: &str, details: serde_json::Value) {
    let entry = AuditEntry {
        timestamp: clock.unix(),
        event_type: event_type.to_string(),
        device_id: None,
        gpio: None,
        severity: AuditSeverity::Info,
        details,
    };
    record(db, ws, entry).await;
}
