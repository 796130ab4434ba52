use serde_json::{json, Value};

use super::{default_validate, CalibrationPoint, ProcessResult, Processor, ValidateResult};

/// DS18B20 1-Wire temperature probe. The sensor itself reports °C, so this
/// processor's job is fault detection, not unit conversion: -127°C is the
/// device's documented fault value, 85°C is its power-on-reset default.
pub struct Ds18b20;

const RANGE: (f64, f64) = (-55.0, 125.0);
const FAULT_VALUE: f64 = -127.0;
const POWER_ON_VALUE: f64 = 85.0;

impl Processor for Ds18b20 {
    fn sensor_type(&self) -> &'static str {
        "ds18b20"
    }

    fn process(&self, raw: f64, _calibration: &Value, _params: &Value) -> Result<ProcessResult, String> {
        if (raw - FAULT_VALUE).abs() < f64::EPSILON {
            return Ok(ProcessResult {
                value: raw,
                unit: "C".into(),
                quality: "error".into(),
                metadata: json!({"fault": "DS18B20_FAULT"}),
            });
        }

        let (quality, metadata) = if (raw - POWER_ON_VALUE).abs() < f64::EPSILON {
            ("suspect", json!({"flag": "power_on_reset"}))
        } else {
            ("good", json!({}))
        };

        Ok(ProcessResult {
            value: raw.clamp(RANGE.0, RANGE.1),
            unit: "C".into(),
            quality: quality.into(),
            metadata,
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

    fn calibrate(&self, _points: &[CalibrationPoint], _method: &str) -> Option<Value> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_value_reports_error_quality() {
        let r = Ds18b20.process(-127.0, &json!({}), &json!({})).unwrap();
        assert_eq!(r.quality, "error");
        assert_eq!(r.metadata["fault"], "DS18B20_FAULT");
    }

    #[test]
    fn power_on_value_flags_suspect() {
        let r = Ds18b20.process(85.0, &json!({}), &json!({})).unwrap();
        assert_eq!(r.quality, "suspect");
    }

    #[test]
    fn normal_reading_clamped_to_range() {
        let r = Ds18b20.process(200.0, &json!({}), &json!({})).unwrap();
        assert_eq!(r.value, 125.0);
        assert_eq!(r.quality, "good");
    }
}
