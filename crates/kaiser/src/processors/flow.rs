use serde_json::{json, Value};

use super::{default_validate, ProcessResult, Processor, ValidateResult};

/// Water flow meter; the device pre-computes L/min from its own pulse
/// counter, so this processor is a pass-through plus unit conversions.
pub struct Flow;

const RANGE: (f64, f64) = (0.0, 500.0);
const GALLONS_PER_LITER: f64 = 0.264172;

impl Processor for Flow {
    fn sensor_type(&self) -> &'static str {
        "flow"
    }

    fn process(&self, raw: f64, _calibration: &Value, _params: &Value) -> Result<ProcessResult, String> {
        Ok(ProcessResult {
            value: raw,
            unit: "L/min".into(),
            quality: "good".into(),
            metadata: json!({
                "ml_per_min": raw * 1000.0,
                "gal_per_min": raw * GALLONS_PER_LITER,
            }),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_ml_and_gallons() {
        let r = Flow.process(2.0, &json!({}), &json!({})).unwrap();
        assert_eq!(r.metadata["ml_per_min"], 2000.0);
        assert!((r.metadata["gal_per_min"].as_f64().unwrap() - 0.528344).abs() < 1e-6);
    }
}
