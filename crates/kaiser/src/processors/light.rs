use serde_json::{json, Value};

use super::{default_validate, ProcessResult, Processor, ValidateResult};

/// Ambient light sensor; the device library already resolves a lux value,
/// so this processor's job is unit conversion (to foot-candles) and level
/// labelling.
pub struct Light;

const RAW_RANGE: (f64, f64) = (0.0, 100_000.0);
const LUX_PER_FOOTCANDLE: f64 = 10.764;

impl Processor for Light {
    fn sensor_type(&self) -> &'static str {
        "light"
    }

    fn process(&self, raw: f64, _calibration: &Value, params: &Value) -> Result<ProcessResult, String> {
        let level = match raw {
            lux if lux < 10.0 => "dark",
            lux if lux < 200.0 => "dim",
            lux if lux < 1000.0 => "normal",
            _ => "bright",
        };

        let unit = params.get("unit").and_then(Value::as_str).unwrap_or("lux");
        let (value, unit) = match unit {
            "fc" => (raw / LUX_PER_FOOTCANDLE, "fc"),
            _ => (raw, "lux"),
        };

        Ok(ProcessResult {
            value,
            unit: unit.into(),
            quality: "good".into(),
            metadata: json!({"level": level}),
        })
    }

    fn default_params(&self) -> Value {
        json!({"unit": "lux"})
    }

    fn validate(&self, raw: f64) -> ValidateResult {
        default_validate(raw, RAW_RANGE)
    }

    fn value_range(&self) -> (f64, f64) {
        RAW_RANGE
    }

    fn raw_value_range(&self) -> (f64, f64) {
        RAW_RANGE
    }
}
