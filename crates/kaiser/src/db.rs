//! SQLite persistence layer (via sqlx): devices, sensor/actuator configs,
//! time-series readings and states, logic rules and their execution
//! history, and the audit trail. Grounded on the teacher's `db.rs`: same
//! `Db` wrapper around `Pool<Sqlite>`, same `connect`/`migrate`/
//! `health_check`/`backup`/`restore_from_backup`/`db_file_path` mechanisms,
//! same mix of `sqlx::query!` for fixed-shape statements and `QueryBuilder`
//! for dynamically-filtered listings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::str::FromStr;

use crate::logic::action::Action;
use crate::logic::condition::Condition;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub zone_id: Option<String>,
    pub kaiser_id: String,
    pub last_seen: i64,
    pub status: String,
    pub heap_free: Option<i64>,
    pub wifi_rssi: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: i64,
    pub device_id: String,
    pub gpio: i64,
    pub sensor_type: String,
    pub name: String,
    pub enabled: bool,
    pub pi_enhanced: bool,
    pub operating_mode: String,
    pub interval_ms: i64,
    pub timeout_sec: i64,
    pub calibration: serde_json::Value,
    pub threshold_min: Option<f64>,
    pub threshold_max: Option<f64>,
    pub threshold_warn: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SensorReadingRow {
    pub device_id: String,
    pub gpio: i64,
    pub raw_value: f64,
    pub processed_value: Option<f64>,
    pub unit: Option<String>,
    pub quality: String,
    pub timestamp: i64,
    pub source: String,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub id: i64,
    pub device_id: String,
    pub gpio: i64,
    pub actuator_type: String,
    pub control_type: String,
    pub critical: bool,
    pub default_state: bool,
    pub safety_limits: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuatorState {
    pub device_id: String,
    pub gpio: i64,
    pub state: bool,
    pub pwm_value: f64,
    pub last_command_ts: Option<i64>,
    pub emergency_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicRule {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub priority: i64,
    pub cooldown_sec: i64,
    pub max_executions_per_hour: i64,
    pub safety_critical: bool,
    pub triggers: Vec<RuleTrigger>,
    pub conditions: Condition,
    pub actions: Vec<Action>,
    pub last_executed: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleTrigger {
    pub device_id: String,
    pub gpio: i64,
    pub sensor_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleExecution {
    pub id: i64,
    pub rule_id: i64,
    pub timestamp: i64,
    pub trigger_data: String,
    pub actions_summary: String,
    pub success: bool,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: i64,
    pub event_type: String,
    pub device_id: Option<String>,
    pub gpio: Option<i64>,
    pub severity: AuditSeverity,
    pub details: serde_json::Value,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/kaiser/kaiser.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Ensures the database uses `auto_vacuum = INCREMENTAL`, required for
    /// `PRAGMA incremental_vacuum` (used by retention jobs) to reclaim freed
    /// pages. Must run outside a transaction, so it can't live in a
    /// migration file.
    async fn ensure_incremental_auto_vacuum(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection for auto_vacuum setup")?;

        let row = sqlx::query("PRAGMA auto_vacuum")
            .fetch_one(&mut *conn)
            .await
            .context("failed to query auto_vacuum mode")?;
        let current: i32 = row.get(0);

        if current != 2 {
            tracing::info!(
                current,
                "converting database to auto_vacuum=INCREMENTAL (one-time VACUUM)"
            );
            sqlx::query("PRAGMA auto_vacuum = INCREMENTAL")
                .execute(&mut *conn)
                .await
                .context("failed to set auto_vacuum = INCREMENTAL")?;
            sqlx::query("VACUUM")
                .execute(&mut *conn)
                .await
                .context("failed to VACUUM after setting auto_vacuum")?;
        }

        Ok(())
    }

    pub async fn migrate(&self) -> Result<()> {
        self.ensure_incremental_auto_vacuum().await?;
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn upsert_device(
        &self,
        device_id: &str,
        zone_id: Option<&str>,
        kaiser_id: &str,
    ) -> Result<()> {
        sqlx::query!(
            r#"
            INSERT INTO devices (device_id, zone_id, kaiser_id, last_seen, status)
            VALUES (?, ?, ?, 0, 'pending')
            ON CONFLICT(device_id) DO UPDATE SET
              zone_id = excluded.zone_id,
              kaiser_id = excluded.kaiser_id
            "#,
            device_id,
            zone_id,
            kaiser_id,
        )
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn get_device_by_external_id(&self, device_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query!(
            r#"
            SELECT id, device_id as "device_id!", zone_id, kaiser_id, last_seen,
                   status as "status!", heap_free, wifi_rssi
            FROM devices WHERE device_id = ?
            "#,
            device_id
        )
        .fetch_optional(&self.pool)
        .await
        .context("get_device_by_external_id failed")?;

        Ok(row.map(|r| Device {
            id: r.id,
            device_id: r.device_id,
            zone_id: r.zone_id,
            kaiser_id: r.kaiser_id,
            last_seen: r.last_seen,
            status: r.status,
            heap_free: r.heap_free,
            wifi_rssi: r.wifi_rssi,
        }))
    }

    pub async fn load_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query!(
            r#"
            SELECT id, device_id as "device_id!", zone_id, kaiser_id, last_seen,
                   status as "status!", heap_free, wifi_rssi
            FROM devices ORDER BY device_id
            "#
        )
        .fetch_all(&self.pool)
        .await
        .context("load_devices failed")?;

        Ok(rows
            .into_iter()
            .map(|r| Device {
                id: r.id,
                device_id: r.device_id,
                zone_id: r.zone_id,
                kaiser_id: r.kaiser_id,
                last_seen: r.last_seen,
                status: r.status,
                heap_free: r.heap_free,
                wifi_rssi: r.wifi_rssi,
            })
            .collect())
    }

    /// Heartbeat update: last_seen + telemetry fields, atomically. Returns
    /// `false` (no row updated) if the device is unregistered — callers
    /// must treat that as `UnknownDevice` and not insert one, per spec.md
    /// §4.7 step 2 (auto-registration disabled).
    pub async fn record_heartbeat(
        &self,
        device_id: &str,
        last_seen: i64,
        heap_free: Option<i64>,
        wifi_rssi: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query!(
            r#"
            UPDATE devices SET last_seen = ?, heap_free = ?, wifi_rssi = ?, status = 'online'
            WHERE device_id = ?
            "#,
            last_seen,
            heap_free,
            wifi_rssi,
            device_id
        )
        .execute(&self.pool)
        .await
        .context("record_heartbeat failed")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_device_status(&self, device_id: &str, status: &str) -> Result<()> {
        sqlx::query!(
            "UPDATE devices SET status = ? WHERE device_id = ?",
            status,
            device_id
        )
        .execute(&self.pool)
        .await
        .context("set_device_status failed")?;
        Ok(())
    }

    // ----------------------------
    // Sensor configs
    // ----------------------------

    pub async fn upsert_sensor_config(&self, s: &SensorConfig) -> Result<()> {
        let calibration = s.calibration.to_string();
        sqlx::query!(
            r#"
            INSERT INTO sensor_configs (
              device_id, gpio, sensor_type, name, enabled, pi_enhanced,
              operating_mode, interval_ms, timeout_sec, calibration,
              threshold_min, threshold_max, threshold_warn
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, gpio) DO UPDATE SET
              sensor_type = excluded.sensor_type,
              name = excluded.name,
              enabled = excluded.enabled,
              pi_enhanced = excluded.pi_enhanced,
              operating_mode = excluded.operating_mode,
              interval_ms = excluded.interval_ms,
              timeout_sec = excluded.timeout_sec,
              calibration = excluded.calibration,
              threshold_min = excluded.threshold_min,
              threshold_max = excluded.threshold_max,
              threshold_warn = excluded.threshold_warn
            "#,
            s.device_id,
            s.gpio,
            s.sensor_type,
            s.name,
            s.enabled,
            s.pi_enhanced,
            s.operating_mode,
            s.interval_ms,
            s.timeout_sec,
            calibration,
            s.threshold_min,
            s.threshold_max,
            s.threshold_warn,
        )
        .execute(&self.pool)
        .await
        .context("upsert_sensor_config failed")?;
        Ok(())
    }

    pub async fn get_sensor_config(
        &self,
        device_id: &str,
        gpio: i64,
    ) -> Result<Option<SensorConfig>> {
        let row = sqlx::query!(
            r#"
            SELECT id, device_id as "device_id!", gpio, sensor_type, name,
                   enabled as "enabled: bool", pi_enhanced as "pi_enhanced: bool",
                   operating_mode, interval_ms, timeout_sec, calibration,
                   threshold_min, threshold_max, threshold_warn
            FROM sensor_configs WHERE device_id = ? AND gpio = ?
            "#,
            device_id,
            gpio
        )
        .fetch_optional(&self.pool)
        .await
        .context("get_sensor_config failed")?;

        Ok(match row {
            None => None,
            Some(r) => Some(SensorConfig {
                id: r.id,
                device_id: r.device_id,
                gpio: r.gpio,
                sensor_type: r.sensor_type,
                name: r.name,
                enabled: r.enabled,
                pi_enhanced: r.pi_enhanced,
                operating_mode: r.operating_mode,
                interval_ms: r.interval_ms,
                timeout_sec: r.timeout_sec,
                calibration: serde_json::from_str(&r.calibration).unwrap_or_default(),
                threshold_min: r.threshold_min,
                threshold_max: r.threshold_max,
                threshold_warn: r.threshold_warn,
            }),
        })
    }

    pub async fn list_sensor_configs(&self) -> Result<Vec<SensorConfig>> {
        let rows = sqlx::query!(
            r#"
            SELECT id, device_id as "device_id!", gpio, sensor_type, name,
                   enabled as "enabled: bool", pi_enhanced as "pi_enhanced: bool",
                   operating_mode, interval_ms, timeout_sec, calibration,
                   threshold_min, threshold_max, threshold_warn
            FROM sensor_configs WHERE enabled = 1
            "#
        )
        .fetch_all(&self.pool)
        .await
        .context("list_sensor_configs failed")?;

        Ok(rows
            .into_iter()
            .map(|r| SensorConfig {
                id: r.id,
                device_id: r.device_id,
                gpio: r.gpio,
                sensor_type: r.sensor_type,
                name: r.name,
                enabled: r.enabled,
                pi_enhanced: r.pi_enhanced,
                operating_mode: r.operating_mode,
                interval_ms: r.interval_ms,
                timeout_sec: r.timeout_sec,
                calibration: serde_json::from_str(&r.calibration).unwrap_or_default(),
                threshold_min: r.threshold_min,
                threshold_max: r.threshold_max,
                threshold_warn: r.threshold_warn,
            })
            .collect())
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    /// Idempotent append: a retry with the same `(device_id, gpio,
    /// timestamp)` updates rather than duplicates, per spec.md §9's
    /// idempotency note.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_reading(
        &self,
        device_id: &str,
        gpio: i64,
        raw_value: f64,
        processed_value: Option<f64>,
        unit: Option<&str>,
        quality: &str,
        timestamp: i64,
        source: &str,
        error_code: Option<&str>,
    ) -> Result<()> {
        sqlx::query!(
            r#"
            INSERT INTO sensor_readings (
              device_id, gpio, raw_value, processed_value, unit, quality,
              timestamp, source, error_code
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, gpio, timestamp) DO UPDATE SET
              raw_value = excluded.raw_value,
              processed_value = excluded.processed_value,
              unit = excluded.unit,
              quality = excluded.quality,
              source = excluded.source,
              error_code = excluded.error_code
            "#,
            device_id,
            gpio,
            raw_value,
            processed_value,
            unit,
            quality,
            timestamp,
            source,
            error_code,
        )
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// The value condition leaves and processors read from: processed value
    /// when present, else the raw value (so ungated/non-enhanced sensors
    /// still participate in threshold conditions).
    pub async fn latest_processed_value(&self, device_id: &str, gpio: i64) -> Result<Option<f64>> {
        let row = sqlx::query!(
            r#"
            SELECT processed_value, raw_value
            FROM sensor_readings
            WHERE device_id = ? AND gpio = ?
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
            device_id,
            gpio
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest_processed_value failed")?;

        Ok(row.map(|r| r.processed_value.unwrap_or(r.raw_value)))
    }

    pub async fn latest_reading_timestamp(&self, device_id: &str, gpio: i64) -> Result<Option<i64>> {
        let row = sqlx::query!(
            r#"
            SELECT timestamp
            FROM sensor_readings
            WHERE device_id = ? AND gpio = ?
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
            device_id,
            gpio
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading_timestamp failed")?;

        Ok(row.map(|r| r.timestamp))
    }

    pub async fn latest_batch(&self, device_ids: &[String]) -> Result<Vec<SensorReadingRow>> {
        if device_ids.is_empty() {
            return Ok(vec![]);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT device_id, gpio, raw_value, processed_value, unit, quality, \
             timestamp, source, error_code FROM sensor_readings r \
             WHERE timestamp = (SELECT MAX(timestamp) FROM sensor_readings \
             WHERE device_id = r.device_id AND gpio = r.gpio) AND device_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in device_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let rows = qb
            .build_query_as::<SensorReadingRow>()
            .fetch_all(&self.pool)
            .await
            .context("latest_batch failed")?;
        Ok(rows)
    }

    pub async fn list_readings(
        &self,
        device_id: Option<&str>,
        gpio: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SensorReadingRow>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT device_id, gpio, raw_value, processed_value, unit, quality, \
             timestamp, source, error_code FROM sensor_readings",
        );

        let mut has_where = false;
        if let Some(did) = device_id {
            qb.push(" WHERE device_id = ");
            qb.push_bind(did.to_string());
            has_where = true;
        }
        if let Some(g) = gpio {
            qb.push(if has_where { " AND " } else { " WHERE " });
            qb.push("gpio = ");
            qb.push_bind(g);
        }

        qb.push(" ORDER BY timestamp DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb
            .build_query_as::<SensorReadingRow>()
            .fetch_all(&self.pool)
            .await
            .context("list_readings failed")?;
        Ok(rows)
    }

    /// Delete readings older than `retention_days` and reclaim disk space.
    /// Only ever invoked when the corresponding `Settings` retention flag is
    /// explicitly enabled (spec.md §4.12 — disabled by default).
    pub async fn prune_old_readings(&self, cutoff_unix: i64) -> Result<u64> {
        let result = sqlx::query!("DELETE FROM sensor_readings WHERE timestamp < ?", cutoff_unix)
            .execute(&self.pool)
            .await
            .context("prune_old_readings failed")?;

        sqlx::query("PRAGMA incremental_vacuum(100)")
            .execute(&self.pool)
            .await
            .context("incremental_vacuum failed")?;

        Ok(result.rows_affected())
    }

    // ----------------------------
    // Actuators
    // ----------------------------

    pub async fn upsert_actuator_config(&self, a: &ActuatorConfig) -> Result<()> {
        let safety_limits = a.safety_limits.to_string();
        sqlx::query!(
            r#"
            INSERT INTO actuator_configs (
              device_id, gpio, actuator_type, control_type, critical,
              default_state, safety_limits
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, gpio) DO UPDATE SET
              actuator_type = excluded.actuator_type,
              control_type = excluded.control_type,
              critical = excluded.critical,
              default_state = excluded.default_state,
              safety_limits = excluded.safety_limits
            "#,
            a.device_id,
            a.gpio,
            a.actuator_type,
            a.control_type,
            a.critical,
            a.default_state,
            safety_limits,
        )
        .execute(&self.pool)
        .await
        .context("upsert_actuator_config failed")?;
        Ok(())
    }

    pub async fn get_actuator_config(
        &self,
        device_id: &str,
        gpio: i64,
    ) -> Result<Option<ActuatorConfig>> {
        let row = sqlx::query!(
            r#"
            SELECT id, device_id as "device_id!", gpio, actuator_type, control_type,
                   critical as "critical: bool", default_state as "default_state: bool",
                   safety_limits
            FROM actuator_configs WHERE device_id = ? AND gpio = ?
            "#,
            device_id,
            gpio
        )
        .fetch_optional(&self.pool)
        .await
        .context("get_actuator_config failed")?;

        Ok(row.map(|r| ActuatorConfig {
            id: r.id,
            device_id: r.device_id,
            gpio: r.gpio,
            actuator_type: r.actuator_type,
            control_type: r.control_type,
            critical: r.critical,
            default_state: r.default_state,
            safety_limits: serde_json::from_str(&r.safety_limits).unwrap_or_default(),
        }))
    }

    pub async fn upsert_actuator_state(&self, s: &ActuatorState) -> Result<()> {
        sqlx::query!(
            r#"
            INSERT INTO actuator_states (device_id, gpio, state, pwm_value, last_command_ts, emergency_state)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, gpio) DO UPDATE SET
              state = excluded.state,
              pwm_value = excluded.pwm_value,
              last_command_ts = excluded.last_command_ts,
              emergency_state = excluded.emergency_state
            "#,
            s.device_id,
            s.gpio,
            s.state,
            s.pwm_value,
            s.last_command_ts,
            s.emergency_state,
        )
        .execute(&self.pool)
        .await
        .context("upsert_actuator_state failed")?;
        Ok(())
    }

    pub async fn get_actuator_state(
        &self,
        device_id: &str,
        gpio: i64,
    ) -> Result<Option<ActuatorState>> {
        let row = sqlx::query!(
            r#"
            SELECT device_id as "device_id!", gpio, state as "state: bool", pwm_value,
                   last_command_ts, emergency_state
            FROM actuator_states WHERE device_id = ? AND gpio = ?
            "#,
            device_id,
            gpio
        )
        .fetch_optional(&self.pool)
        .await
        .context("get_actuator_state failed")?;

        Ok(row.map(|r| ActuatorState {
            device_id: r.device_id,
            gpio: r.gpio,
            state: r.state,
            pwm_value: r.pwm_value,
            last_command_ts: r.last_command_ts,
            emergency_state: r.emergency_state,
        }))
    }

    // ----------------------------
    // Logic rules
    // ----------------------------

    /// Upserts by `name`: re-seeding `config.toml` updates an existing rule
    /// in place rather than duplicating it, and leaves `last_executed`
    /// untouched so cooldown/rate-limit history survives a re-seed.
    pub async fn upsert_logic_rule(&self, rule: &LogicRule) -> Result<i64> {
        let triggers = serde_json::to_string(&rule.triggers)?;
        let conditions = serde_json::to_string(&rule.conditions)?;
        let actions = serde_json::to_string(&rule.actions)?;
        sqlx::query!(
            r#"
            INSERT INTO logic_rules (
              name, enabled, priority, cooldown_sec, max_executions_per_hour,
              safety_critical, triggers, conditions, actions
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              enabled = excluded.enabled,
              priority = excluded.priority,
              cooldown_sec = excluded.cooldown_sec,
              max_executions_per_hour = excluded.max_executions_per_hour,
              safety_critical = excluded.safety_critical,
              triggers = excluded.triggers,
              conditions = excluded.conditions,
              actions = excluded.actions
            "#,
            rule.name,
            rule.enabled,
            rule.priority,
            rule.cooldown_sec,
            rule.max_executions_per_hour,
            rule.safety_critical,
            triggers,
            conditions,
            actions,
        )
        .execute(&self.pool)
        .await
        .context("upsert_logic_rule failed")?;

        let row = sqlx::query!("SELECT id FROM logic_rules WHERE name = ?", rule.name)
            .fetch_one(&self.pool)
            .await
            .context("failed to fetch id of upserted logic rule")?;
        Ok(row.id)
    }

    pub async fn mark_rule_executed(&self, rule_id: i64, at_unix: i64) -> Result<()> {
        sqlx::query!(
            "UPDATE logic_rules SET last_executed = ? WHERE id = ?",
            at_unix,
            rule_id
        )
        .execute(&self.pool)
        .await
        .context("mark_rule_executed failed")?;
        Ok(())
    }

    async fn load_enabled_rules(&self) -> Result<Vec<LogicRule>> {
        let rows = sqlx::query!(
            r#"
            SELECT id, name, enabled as "enabled: bool", priority, cooldown_sec,
                   max_executions_per_hour, safety_critical as "safety_critical: bool",
                   triggers, conditions, actions, last_executed
            FROM logic_rules WHERE enabled = 1 ORDER BY priority ASC
            "#
        )
        .fetch_all(&self.pool)
        .await
        .context("load_enabled_rules failed")?;

        rows.into_iter()
            .map(|r| {
                Ok(LogicRule {
                    id: r.id,
                    name: r.name,
                    enabled: r.enabled,
                    priority: r.priority,
                    cooldown_sec: r.cooldown_sec,
                    max_executions_per_hour: r.max_executions_per_hour,
                    safety_critical: r.safety_critical,
                    triggers: serde_json::from_str(&r.triggers)?,
                    conditions: serde_json::from_str(&r.conditions)?,
                    actions: serde_json::from_str(&r.actions)?,
                    last_executed: r.last_executed,
                })
            })
            .collect()
    }

    /// Rules whose trigger index contains `(deviceId, gpio, sensorType)`.
    pub async fn get_rules_by_trigger(
        &self,
        device_id: &str,
        gpio: i64,
        sensor_type: &str,
    ) -> Result<Vec<LogicRule>> {
        let rules = self.load_enabled_rules().await?;
        Ok(rules
            .into_iter()
            .filter(|r| {
                r.triggers.iter().any(|t| {
                    t.device_id == device_id && t.gpio == gpio && t.sensor_type == sensor_type
                })
            })
            .collect())
    }

    /// Rules whose condition tree contains a time-window predicate —
    /// evaluated by the Scheduler's 60s timer tick.
    pub async fn get_timer_rules(&self) -> Result<Vec<LogicRule>> {
        let rules = self.load_enabled_rules().await?;
        Ok(rules
            .into_iter()
            .filter(|r| condition_has_time_window(&r.conditions))
            .collect())
    }

    pub async fn log_execution(&self, exec: &RuleExecutionInput<'_>) -> Result<()> {
        sqlx::query!(
            r#"
            INSERT INTO rule_executions (
              rule_id, timestamp, trigger_data, actions_summary, success,
              duration_ms, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            exec.rule_id,
            exec.timestamp,
            exec.trigger_data,
            exec.actions_summary,
            exec.success,
            exec.duration_ms,
            exec.error_message,
        )
        .execute(&self.pool)
        .await
        .context("log_execution failed")?;
        Ok(())
    }

    // ----------------------------
    // Audit trail
    // ----------------------------

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let severity = entry.severity.as_str();
        let details = entry.details.to_string();
        sqlx::query!(
            r#"
            INSERT INTO audit_log (timestamp, event_type, device_id, gpio, severity, details)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            entry.timestamp,
            entry.event_type,
            entry.device_id,
            entry.gpio,
            severity,
            details,
        )
        .execute(&self.pool)
        .await
        .context("append_audit failed")?;
        Ok(())
    }

    /// Most recent executions for `rule_id`, newest first.
    pub async fn list_rule_executions(&self, rule_id: i64, limit: i64) -> Result<Vec<RuleExecution>> {
        let rows = sqlx::query!(
            r#"
            SELECT id, rule_id, timestamp, trigger_data, actions_summary,
                   success as "success: bool", duration_ms, error_message
            FROM rule_executions WHERE rule_id = ? ORDER BY id DESC LIMIT ?
            "#,
            rule_id,
            limit
        )
        .fetch_all(&self.pool)
        .await
        .context("list_rule_executions failed")?;

        Ok(rows
            .into_iter()
            .map(|r| RuleExecution {
                id: r.id,
                rule_id: r.rule_id,
                timestamp: r.timestamp,
                trigger_data: r.trigger_data,
                actions_summary: r.actions_summary,
                success: r.success,
                duration_ms: r.duration_ms,
                error_message: r.error_message,
            })
            .collect())
    }

    /// Most recent audit entries, newest first, optionally filtered to one
    /// `event_type`.
    pub async fn list_audit_log(&self, event_type: Option<&str>, limit: i64) -> Result<Vec<AuditEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT timestamp, event_type, device_id, gpio, severity, details FROM audit_log",
        );
        if let Some(et) = event_type {
            qb.push(" WHERE event_type = ");
            qb.push_bind(et.to_string());
        }
        qb.push(" ORDER BY id DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await.context("list_audit_log failed")?;
        rows.into_iter()
            .map(|row| {
                let severity_str: String = row.get("severity");
                let details_str: String = row.get("details");
                Ok(AuditEntry {
                    timestamp: row.get("timestamp"),
                    event_type: row.get("event_type"),
                    device_id: row.get("device_id"),
                    gpio: row.get("gpio"),
                    severity: match severity_str.as_str() {
                        "warning" => AuditSeverity::Warning,
                        "error" => AuditSeverity::Error,
                        "critical" => AuditSeverity::Critical,
                        _ => AuditSeverity::Info,
                    },
                    details: serde_json::from_str(&details_str).unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }

    /// Quick connectivity check — runs a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("db health check failed")?;
        Ok(())
    }

    /// Create a consistent backup of the database at `dest_path` via
    /// `VACUUM INTO`, written to a temp file and atomically renamed so a
    /// crash mid-write can't corrupt the previous good backup.
    pub async fn backup(&self, dest_path: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(dest_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create backup dir {}", parent.display()))?;
        }

        let tmp_path = format!("{dest_path}.tmp");
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let escaped = tmp_path.replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{escaped}'"))
            .execute(&self.pool)
            .await
            .with_context(|| format!("VACUUM INTO '{tmp_path}' failed"))?;

        tokio::fs::rename(&tmp_path, dest_path)
            .await
            .with_context(|| format!("rename '{tmp_path}' -> '{dest_path}' failed"))?;

        Ok(())
    }
}

pub struct RuleExecutionInput<'a> {
    pub rule_id: i64,
    pub timestamp: i64,
    pub trigger_data: &'a str,
    pub actions_summary: &'a str,
    pub success: bool,
    pub duration_ms: i64,
    pub error_message: Option<&'a str>,
}

fn condition_has_time_window(cond: &Condition) -> bool {
    match cond {
        Condition::TimeWindow { .. } => true,
        Condition::Threshold { .. } => false,
        Condition::And(children) | Condition::Or(children) => {
            children.iter().any(condition_has_time_window)
        }
    }
}

// ---------------------------------------------------------------------------
// Backup / restore helpers (SD-card wear mitigation, generalized from the
// teacher's tmpfs-working-dir pattern — still useful for any flash-backed
// deployment host).
// ---------------------------------------------------------------------------

pub fn db_file_path(db_url: &str) -> Option<String> {
    let stripped = db_url.strip_prefix("sqlite:")?;
    if stripped.starts_with(":memory:") || stripped.is_empty() {
        return None;
    }
    let path = stripped.split('?').next().unwrap_or(stripped);
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

pub fn restore_from_backup(working_path: &str, backup_path: &str) -> Result<bool> {
    let backup = std::path::Path::new(backup_path);
    if !backup.exists() {
        tracing::info!(backup_path, "no backup file found — starting with fresh database");
        return Ok(false);
    }

    let working = std::path::Path::new(working_path);
    let needs_restore =
        !working.exists() || working.metadata().map(|m| m.len() == 0).unwrap_or(true);

    if needs_restore {
        if let Some(parent) = working.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        std::fs::copy(backup, working)
            .with_context(|| format!("restore backup '{backup_path}' -> '{working_path}'"))?;
        tracing::info!(backup_path, working_path, "database restored from backup");
        Ok(true)
    } else {
        tracing::debug!(working_path, "working database exists — skipping restore");
        Ok(false)
    }
}
