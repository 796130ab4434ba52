use serde_json::{json, Value};

use super::{default_validate, ProcessResult, Processor, ValidateResult};

/// CO2 sensor; raw value is already ppm. Adds IAQ banding per spec.md
/// §4.6's table.
pub struct Co2;

const RANGE: (f64, f64) = (0.0, 10_000.0);

fn iaq_label(ppm: f64) -> &'static str {
    if ppm < 600.0 {
        "excellent"
    } else if ppm < 1000.0 {
        "good"
    } else if ppm < 1500.0 {
        "fair"
    } else if ppm < 2000.0 {
        "poor"
    } else {
        "bad"
    }
}

impl Processor for Co2 {
    fn sensor_type(&self) -> &'static str {
        "co2"
    }

    fn process(&self, raw: f64, _calibration: &Value, _params: &Value) -> Result<ProcessResult, String> {
        Ok(ProcessResult {
            value: raw,
            unit: "ppm".into(),
            quality: "good".into(),
            metadata: json!({"iaq": iaq_label(raw)}),
        })
    }

    fn validate(&self, raw: f64) -> ValidateResult {
        default_validate(raw, RANGE)
    }

    fn value_range(&self) -> (f64, f64) {
        RANGE
    }

    fn raw_value_range(&self) -> (f64, f64) {
        RANGE
    }
}
