use serde_json::{json, Value};

use super::{default_validate, ProcessResult, Processor, ValidateResult};

/// Capacitive/resistive soil moisture probe. Linear map between a dry-air
/// and a saturated-water calibration anchor (`calibration = {raw_dry,
/// raw_wet}`). Supports inverted probes where `raw_wet > raw_dry`.
pub struct Moisture;

const RAW_RANGE: (f64, f64) = (0.0, 4095.0);
const VALUE_RANGE: (f64, f64) = (0.0, 100.0);

impl Processor for Moisture {
    fn sensor_type(&self) -> &'static str {
        "moisture"
    }

    fn process(&self, raw: f64, calibration: &Value, _params: &Value) -> Result<ProcessResult, String> {
        let raw_dry = calibration.get("raw_dry").and_then(Value::as_f64).unwrap_or(3000.0);
        let raw_wet = calibration.get("raw_wet").and_then(Value::as_f64).unwrap_or(1000.0);

        let range = raw_dry - raw_wet;
        if range == 0.0 {
            return Err("degenerate moisture calibration: raw_dry == raw_wet".into());
        }
        let fraction = (raw_dry - raw) / range;
        let percent = (fraction * 100.0).clamp(VALUE_RANGE.0, VALUE_RANGE.1);

        Ok(ProcessResult {
            value: percent,
            unit: "%".into(),
            quality: "good".into(),
            metadata: json!({}),
        })
    }

    fn default_params(&self) -> Value {
        json!({})
    }

    fn validate(&self, raw: f64) -> ValidateResult {
        default_validate(raw, RAW_RANGE)
    }

    fn value_range(&self) -> (f64, f64) {
        VALUE_RANGE
    }

    fn raw_value_range(&self) -> (f64, f64) {
        RAW_RANGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_is_fifty_percent() {
        let r = Moisture
            .process(2000.0, &json!({"raw_dry": 3000.0, "raw_wet": 1000.0}), &json!({}))
            .unwrap();
        assert!((r.value - 50.0).abs() < 1e-6);
    }

    #[test]
    fn inverted_calibration_still_maps_correctly() {
        let r = Moisture
            .process(2000.0, &json!({"raw_dry": 1000.0, "raw_wet": 3000.0}), &json!({}))
            .unwrap();
        assert!((r.value - 50.0).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_clamped() {
        let r = Moisture
            .process(5000.0, &json!({"raw_dry": 3000.0, "raw_wet": 1000.0}), &json!({}))
            .unwrap();
        assert_eq!(r.value, 0.0);
    }
}
