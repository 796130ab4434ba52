//! Pi-Enhanced Processor Registry: a static, read-only-after-startup
//! catalogue mapping a normalised sensor type string to its transform.
//! Generalizes the teacher's `db.rs` `compute_moisture`/
//! `is_reading_plausible` pair (one hard-coded transform for one sensor
//! kind) into a trait + registry covering every built-in processor in
//! spec.md §4.6's table. Per spec.md §9's design note, dynamic module
//! discovery is replaced with a compile-time registration table.

mod bmp280;
mod co2;
mod ds18b20;
mod ec;
mod flow;
mod light;
mod moisture;
mod ph;
mod sht31;

use std::collections::HashMap;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub value: f64,
    pub unit: String,
    pub quality: String,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct ValidateResult {
    pub valid: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrationPoint {
    pub raw: f64,
    pub reference: f64,
}

/// Capability set every sensor-type transform implements, per spec.md
/// §4.6's processor contract.
pub trait Processor: Send + Sync {
    fn sensor_type(&self) -> &'static str;
    fn process(&self, raw: f64, calibration: &Value, params: &Value) -> Result<ProcessResult, String>;
    fn validate(&self, raw: f64) -> ValidateResult;
    fn default_params(&self) -> Value {
        Value::Object(Default::default())
    }
    fn value_range(&self) -> (f64, f64);
    fn raw_value_range(&self) -> (f64, f64);
    fn calibrate(&self, _points: &[CalibrationPoint], _method: &str) -> Option<Value> {
        None
    }
}

fn default_validate(raw: f64, range: (f64, f64)) -> ValidateResult {
    if raw.is_nan() || raw.is_infinite() {
        return ValidateResult {
            valid: false,
            error: Some("raw value is not finite".into()),
            warnings: vec![],
        };
    }
    let mut warnings = vec![];
    if raw < range.0 || raw > range.1 {
        warnings.push(format!("raw {raw} outside expected range {:?}", range));
    }
    ValidateResult {
        valid: true,
        error: None,
        warnings,
    }
}

pub struct ProcessorRegistry {
    processors: HashMap<&'static str, Box<dyn Processor>>,
    aliases: HashMap<&'static str, &'static str>,
}

impl ProcessorRegistry {
    /// Populated once at startup; panics on a duplicate `sensor_type()`
    /// registration, per spec.md §4.6 ("must be unique; duplicate
    /// registration is an error").
    pub fn build() -> Self {
        let mut processors: HashMap<&'static str, Box<dyn Processor>> = HashMap::new();
        let built_ins: Vec<Box<dyn Processor>> = vec![
            Box::new(ds18b20::Ds18b20),
            Box::new(sht31::Sht31Temp),
            Box::new(sht31::Sht31Humidity),
            Box::new(bmp280::Bmp280Pressure),
            Box::new(bmp280::Bmp280Temp),
            Box::new(ph::Ph),
            Box::new(ec::Ec),
            Box::new(moisture::Moisture),
            Box::new(light::Light),
            Box::new(co2::Co2),
            Box::new(flow::Flow),
        ];
        for p in built_ins {
            let key = p.sensor_type();
            if processors.insert(key, p).is_some() {
                panic!("duplicate processor registration for sensor type {key}");
            }
        }

        let aliases = HashMap::from([
            ("temperature_sht31", "sht31_temp"),
            ("humidity_sht31", "sht31_humidity"),
            ("pressure_bmp280", "bmp280_pressure"),
            ("temperature_bmp280", "bmp280_temp"),
            ("ph_sensor", "ph"),
            ("ec_sensor", "ec"),
            ("soil_moisture", "moisture"),
            ("light_sensor", "light"),
            ("co2_sensor", "co2"),
            ("flow_sensor", "flow"),
        ]);

        Self { processors, aliases }
    }

    /// Normalises via the alias table (e.g. `temperature_sht31` ->
    /// `sht31_temp`); unknown types pass through unchanged so lookup can
    /// report `ProcessorMissing` rather than silently renaming.
    pub fn normalize_owned(&self, sensor_type: &str) -> String {
        self.aliases
            .get(sensor_type)
            .map(|s| s.to_string())
            .unwrap_or_else(|| sensor_type.to_string())
    }

    pub fn get(&self, sensor_type: &str) -> Option<&dyn Processor> {
        let normalized = self.normalize_owned(sensor_type);
        self.processors.get(normalized.as_str()).map(|b| b.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_built_in_by_canonical_name() {
        let reg = ProcessorRegistry::build();
        for name in [
            "ds18b20",
            "sht31_temp",
            "sht31_humidity",
            "bmp280_pressure",
            "bmp280_temp",
            "ph",
            "ec",
            "moisture",
            "light",
            "co2",
            "flow",
        ] {
            assert!(reg.get(name).is_some(), "missing processor for {name}");
        }
    }

    #[test]
    fn registry_resolves_aliases() {
        let reg = ProcessorRegistry::build();
        assert!(reg.get("temperature_sht31").is_some());
        assert_eq!(reg.normalize_owned("temperature_sht31"), "sht31_temp");
    }

    #[test]
    fn unknown_sensor_type_is_missing() {
        let reg = ProcessorRegistry::build();
        assert!(reg.get("exotic_quantum_sensor").is_none());
    }

    #[test]
    fn every_processor_is_total_over_its_raw_range_with_default_params() {
        let reg = ProcessorRegistry::build();
        for name in [
            "ds18b20",
            "sht31_temp",
            "sht31_humidity",
            "bmp280_pressure",
            "bmp280_temp",
            "ph",
            "ec",
            "moisture",
            "light",
            "co2",
            "flow",
        ] {
            let p = reg.get(name).unwrap();
            let (lo, hi) = p.raw_value_range();
            let mid = (lo + hi) / 2.0;
            let params = p.default_params();
            let calibration = Value::Object(Default::default());
            let result = p.process(mid, &calibration, &params);
            assert!(result.is_ok(), "{name} failed to process midpoint of its own range");
        }
    }
}
