use serde_json::{json, Value};

use super::{default_validate, CalibrationPoint, ProcessResult, Processor, ValidateResult};

/// pH probe, 2-point calibrated: `calibration = {slope, offset}`,
/// `value = slope * raw + offset`. Optional temperature compensation via
/// `params.temperature_c` (probes drift ~0.03 pH per °C from a 25°C
/// reference).
pub struct Ph;

const VALUE_RANGE: (f64, f64) = (0.0, 14.0);
const RAW_RANGE: (f64, f64) = (0.0, 4095.0);
const TEMP_COMPENSATION_PER_DEGREE: f64 = 0.03;
const TEMP_REFERENCE_C: f64 = 25.0;

impl Processor for Ph {
    fn sensor_type(&self) -> &'static str {
        "ph"
    }

    fn process(&self, raw: f64, calibration: &Value, params: &Value) -> Result<ProcessResult, String> {
        let slope = calibration.get("slope").and_then(Value::as_f64).unwrap_or(1.0);
        let offset = calibration.get("offset").and_then(Value::as_f64).unwrap_or(0.0);

        let mut value = slope * raw + offset;

        let mut metadata = json!({});
        if let Some(temp_c) = params.get("temperature_c").and_then(Value::as_f64) {
            let delta = temp_c - TEMP_REFERENCE_C;
            value -= delta * TEMP_COMPENSATION_PER_DEGREE;
            metadata = json!({"temperature_compensation_applied": true, "temperature_c": temp_c});
        }

        let quality = if (VALUE_RANGE.0..=VALUE_RANGE.1).contains(&value) {
            "good"
        } else {
            "suspect"
        };

        Ok(ProcessResult {
            value: value.clamp(VALUE_RANGE.0, VALUE_RANGE.1),
            unit: "pH".into(),
            quality: quality.into(),
            metadata,
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

    fn calibrate(&self, points: &[CalibrationPoint], _method: &str) -> Option<Value> {
        if points.len() < 2 {
            return None;
        }
        let (a, b) = (points[0], points[1]);
        if (a.raw - b.raw).abs() < f64::EPSILON {
            return None;
        }
        let slope = (b.reference - a.reference) / (b.raw - a.raw);
        let offset = a.reference - slope * a.raw;
        Some(json!({"slope": slope, "offset": offset}))
    }
}
