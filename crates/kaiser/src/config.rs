//! Configuration: runtime `Settings` read from the environment (spec.md §6,
//! the ambient-stack configuration section of SPEC_FULL.md §0), plus TOML
//! seeding of static definitions (devices, sensor/actuator configs, logic
//! rules) applied into the repository at startup. Grounded on teacher
//! `config.rs`'s zone/sensor TOML loader and `main.rs`'s direct
//! `env::var(...)` reads, generalized from a fixed zone/sensor shape to the
//! God-Kaiser data model.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::db::{ActuatorConfig, Db, LogicRule, RuleTrigger, SensorConfig};
use crate::logic::action::Action;
use crate::logic::condition::Condition;

// ---------------------------------------------------------------------------
// Runtime settings (environment)
// ---------------------------------------------------------------------------

/// Operational knobs read once at startup. Broker connectivity itself
/// (`MQTT_HOST`/`MQTT_PORT`/`MQTT_USER`/...) stays read directly inside
/// `mqtt::KaiserMqtt::connect`, matching the teacher's own layering.
#[derive(Debug, Clone)]
pub struct Settings {
    pub kaiser_id: String,
    pub db_url: String,
    pub config_path: String,
    pub web_port: u16,
    pub offline_buffer_capacity: usize,
    pub dispatch_workers: usize,
    pub rate_limit_global_per_sec: usize,
    pub rate_limit_device_per_sec: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout_sec: u64,
    /// Only `"flat"` is implemented (Open Question resolution #1); kept as a
    /// config surface so the choice is explicit rather than silently fixed.
    pub egress_payload_shape: String,
    pub db_backup_path: Option<String>,
    pub db_backup_interval_sec: Option<u64>,
    pub retention_enabled: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            kaiser_id: env_string("KAISER_ID", "god"),
            db_url: env_string("DB_URL", "sqlite:/var/lib/kaiser/kaiser.db"),
            config_path: env_string("KAISER_CONFIG_PATH", "config.toml"),
            web_port: env_parsed("KAISER_WEB_PORT", 8080),
            offline_buffer_capacity: env_parsed("KAISER_OFFLINE_BUFFER_CAPACITY", 1000),
            dispatch_workers: env_parsed("KAISER_DISPATCH_WORKERS", crate::dispatch::DEFAULT_MAX_WORKERS),
            rate_limit_global_per_sec: env_parsed("KAISER_RATE_LIMIT_GLOBAL_PER_SEC", 100),
            rate_limit_device_per_sec: env_parsed("KAISER_RATE_LIMIT_DEVICE_PER_SEC", 20),
            breaker_failure_threshold: env_parsed("KAISER_BREAKER_FAILURE_THRESHOLD", 5),
            breaker_reset_timeout_sec: env_parsed("KAISER_BREAKER_RESET_TIMEOUT_SEC", 30),
            egress_payload_shape: env_string("KAISER_EGRESS_PAYLOAD_SHAPE", "flat"),
            db_backup_path: std::env::var("DB_BACKUP_PATH").ok(),
            db_backup_interval_sec: std::env::var("DB_BACKUP_INTERVAL_SEC").ok().and_then(|v| v.parse().ok()),
            retention_enabled: env_parsed("KAISER_RETENTION_ENABLED", false),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Seed config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub sensor_configs: Vec<SensorConfig>,
    #[serde(default)]
    pub actuator_configs: Vec<ActuatorConfig>,
    #[serde(default)]
    pub logic_rules: Vec<LogicRuleEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    #[serde(default)]
    pub zone_id: Option<String>,
}

/// A seeded rule; `id`/`last_executed` are database-assigned and omitted
/// from the TOML shape.
#[derive(Debug, Deserialize)]
pub struct LogicRuleEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: i64,
    pub cooldown_sec: i64,
    pub max_executions_per_hour: i64,
    #[serde(default)]
    pub safety_critical: bool,
    pub triggers: Vec<RuleTrigger>,
    pub conditions: Condition,
    pub actions: Vec<Action>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

pub fn load(path: &str) -> Result<SeedConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: SeedConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Upserts every seeded row into the repository, exactly as the teacher's
/// `config::apply` does for zones/sensors.
pub async fn apply(config: &SeedConfig, db: &Db, kaiser_id: &str) -> Result<()> {
    for d in &config.devices {
        db.upsert_device(&d.device_id, d.zone_id.as_deref(), kaiser_id)
            .await
            .with_context(|| format!("failed to upsert device '{}'", d.device_id))?;
    }

    for s in &config.sensor_configs {
        db.upsert_sensor_config(s)
            .await
            .with_context(|| format!("failed to upsert sensor config '{}/{}'", s.device_id, s.gpio))?;
    }

    for a in &config.actuator_configs {
        db.upsert_actuator_config(a)
            .await
            .with_context(|| format!("failed to upsert actuator config '{}/{}'", a.device_id, a.gpio))?;
    }

    for r in &config.logic_rules {
        let rule = LogicRule {
            id: 0,
            name: r.name.clone(),
            enabled: r.enabled,
            priority: r.priority,
            cooldown_sec: r.cooldown_sec,
            max_executions_per_hour: r.max_executions_per_hour,
            safety_critical: r.safety_critical,
            triggers: r.triggers.clone(),
            conditions: r.conditions.clone(),
            actions: r.actions.clone(),
            last_executed: None,
        };
        db.upsert_logic_rule(&rule)
            .await
            .with_context(|| format!("failed to upsert logic rule '{}'", r.name))?;
    }

    tracing::info!(
        devices = config.devices.len(),
        sensor_configs = config.sensor_configs.len(),
        actuator_configs = config.actuator_configs.len(),
        logic_rules = config.logic_rules.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_seed_config() {
        let toml_str = r#"
[[devices]]
device_id = "ESP_1"
zone_id = "greenhouse-a"

[[sensor_configs]]
id = 0
device_id = "ESP_1"
gpio = 4
sensor_type = "ds18b20"
name = "soil probe"
enabled = true
pi_enhanced = true
operating_mode = "normal"
interval_ms = 5000
timeout_sec = 300
calibration = {}
threshold_min = 10.0
threshold_max = 35.0
threshold_warn = 30.0

[[logic_rules]]
name = "high temp fan"
priority = 10
cooldown_sec = 300
max_executions_per_hour = 12
triggers = [{ device_id = "ESP_1", gpio = 4, sensor_type = "ds18b20" }]
conditions = { kind = "threshold", device_id = "ESP_1", gpio = 4, sensor_type = "ds18b20", op = "gt", value = 30.0 }
actions = [{ kind = "actuator_command", device_id = "ESP_1", gpio = 16, command = "ON", value = 1.0 }]
"#;
        let config: SeedConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.sensor_configs.len(), 1);
        assert_eq!(config.logic_rules.len(), 1);
        assert_eq!(config.logic_rules[0].name, "high temp fan");
        assert!(config.logic_rules[0].enabled);
    }

    #[test]
    fn parse_empty_seed_config() {
        let config: SeedConfig = toml::from_str("").unwrap();
        assert!(config.devices.is_empty());
        assert!(config.logic_rules.is_empty());
    }

    #[test]
    fn settings_fall_back_to_defaults_without_env() {
        for key in [
            "KAISER_ID",
            "KAISER_WEB_PORT",
            "KAISER_RETENTION_ENABLED",
            "DB_BACKUP_PATH",
        ] {
            std::env::remove_var(key);
        }
        let settings = Settings::from_env();
        assert_eq!(settings.kaiser_id, "god");
        assert_eq!(settings.web_port, 8080);
        assert!(!settings.retention_enabled);
        assert!(settings.db_backup_path.is_none());
    }

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let toml_str = r#"
[[devices]]
device_id = "ESP_1"

[[sensor_configs]]
id = 0
device_id = "ESP_1"
gpio = 4
sensor_type = "ds18b20"
name = "soil probe"
enabled = true
pi_enhanced = false
operating_mode = "normal"
interval_ms = 5000
timeout_sec = 300
calibration = {}

[[logic_rules]]
name = "high temp fan"
priority = 10
cooldown_sec = 300
max_executions_per_hour = 12
triggers = [{ device_id = "ESP_1", gpio = 4, sensor_type = "ds18b20" }]
conditions = { kind = "threshold", device_id = "ESP_1", gpio = 4, sensor_type = "ds18b20", op = "gt", value = 30.0 }
actions = [{ kind = "actuator_command", device_id = "ESP_1", gpio = 16, command = "ON", value = 1.0 }]
"#;
        let config: SeedConfig = toml::from_str(toml_str).unwrap();
        apply(&config, &db, "god").await.unwrap();

        let device = db.get_device_by_external_id("ESP_1").await.unwrap();
        assert!(device.is_some());

        let sensor = db.get_sensor_config("ESP_1", 4).await.unwrap();
        assert!(sensor.is_some());

        // Re-applying must update the existing rule rather than duplicate it.
        apply(&config, &db, "god").await.unwrap();
        let rules = db.get_rules_by_trigger("ESP_1", 4, "ds18b20").await.unwrap();
        assert_eq!(rules.iter().filter(|r| r.name == "high temp fan").count(), 1);
    }
}
