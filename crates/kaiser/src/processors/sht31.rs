use serde_json::{json, Value};

use super::{default_validate, ProcessResult, Processor, ValidateResult};

/// The SHT31 reports temperature and humidity from one device; since the
/// registry maps one sensor type to one processor, it's exposed as two
/// separate entries (`sht31_temp`, `sht31_humidity`) rather than one
/// processor returning a tuple.
pub struct Sht31Temp;
pub struct Sht31Humidity;

const TEMP_RANGE: (f64, f64) = (-40.0, 125.0);
const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);

impl Processor for Sht31Temp {
    fn sensor_type(&self) -> &'static str {
        "sht31_temp"
    }

    fn process(&self, raw: f64, _calibration: &Value, _params: &Value) -> Result<ProcessResult, String> {
        Ok(ProcessResult {
            value: raw.clamp(TEMP_RANGE.0, TEMP_RANGE.1),
            unit: "C".into(),
            quality: "good".into(),
            metadata: json!({}),
        })
    }

    fn validate(&self, raw: f64) -> ValidateResult {
        default_validate(raw, TEMP_RANGE)
    }

    fn value_range(&self) -> (f64, f64) {
        TEMP_RANGE
    }

    fn raw_value_range(&self) -> (f64, f64) {
        TEMP_RANGE
    }
}

impl Processor for Sht31Humidity {
    fn sensor_type(&self) -> &'static str {
        "sht31_humidity"
    }

    fn process(&self, raw: f64, _calibration: &Value, _params: &Value) -> Result<ProcessResult, String> {
        Ok(ProcessResult {
            value: raw.clamp(HUMIDITY_RANGE.0, HUMIDITY_RANGE.1),
            unit: "%RH".into(),
            quality: "good".into(),
            metadata: json!({}),
        })
    }

    fn validate(&self, raw: f64) -> ValidateResult {
        default_validate(raw, HUMIDITY_RANGE)
    }

    fn value_range(&self) -> (f64, f64) {
        HUMIDITY_RANGE
    }

    fn raw_value_range(&self) -> (f64, f64) {
        HUMIDITY_RANGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_passes_through_within_range() {
        let r = Sht31Temp.process(24.5, &json!({}), &json!({})).unwrap();
        assert_eq!(r.value, 24.5);
        assert_eq!(r.unit, "C");
    }

    #[test]
    fn humidity_clamped_to_0_100() {
        let r = Sht31Humidity.process(150.0, &json!({}), &json!({})).unwrap();
        assert_eq!(r.value, 100.0);
    }
}
