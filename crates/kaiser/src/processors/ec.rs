use serde_json::{json, Value};

use super::{default_validate, ProcessResult, Processor, ValidateResult};

/// Electrical conductivity probe. 2-point calibrated against the standard
/// 1413 and 12880 µS/cm reference solutions (`calibration = {raw_low,
/// ref_low, raw_high, ref_high}`, defaulting to those two reference
/// values). Temperature-compensated per `ec = ec_raw / (1 + 0.02*(T-25))`
/// when `params.temperature_c` is supplied. `params.unit` selects the
/// output unit: `us_cm` (default), `ms_cm`, or `ppm`.
pub struct Ec;

const RAW_RANGE: (f64, f64) = (0.0, 4095.0);
const VALUE_RANGE: (f64, f64) = (0.0, 20_000.0);
const PPM_CONVERSION_FACTOR: f64 = 0.5;

impl Processor for Ec {
    fn sensor_type(&self) -> &'static str {
        "ec"
    }

    fn process(&self, raw: f64, calibration: &Value, params: &Value) -> Result<ProcessResult, String> {
        let raw_low = calibration.get("raw_low").and_then(Value::as_f64).unwrap_or(0.0);
        let ref_low = calibration.get("ref_low").and_then(Value::as_f64).unwrap_or(1413.0);
        let raw_high = calibration.get("raw_high").and_then(Value::as_f64).unwrap_or(4095.0);
        let ref_high = calibration.get("ref_high").and_then(Value::as_f64).unwrap_or(12880.0);

        if (raw_high - raw_low).abs() < f64::EPSILON {
            return Err("degenerate EC calibration: raw_low == raw_high".into());
        }
        let slope = (ref_high - ref_low) / (raw_high - raw_low);
        let ec_raw = ref_low + slope * (raw - raw_low);

        let ec_compensated = match params.get("temperature_c").and_then(Value::as_f64) {
            Some(temp_c) => ec_raw / (1.0 + 0.02 * (temp_c - 25.0)),
            None => ec_raw,
        };

        let unit = params.get("unit").and_then(Value::as_str).unwrap_or("us_cm");
        let (value, unit) = match unit {
            "ms_cm" => (ec_compensated / 1000.0, "mS/cm"),
            "ppm" => (ec_compensated * PPM_CONVERSION_FACTOR, "ppm"),
            _ => (ec_compensated, "uS/cm"),
        };

        Ok(ProcessResult {
            value,
            unit: unit.into(),
            quality: "good".into(),
            metadata: json!({"ec_raw_us_cm": ec_raw}),
        })
    }

    fn default_params(&self) -> Value {
        json!({"unit": "us_cm"})
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
    fn default_calibration_maps_endpoints_to_reference_solutions() {
        let r_low = Ec.process(0.0, &json!({}), &json!({})).unwrap();
        assert!((r_low.value - 1413.0).abs() < 1e-6);
        let r_high = Ec.process(4095.0, &json!({}), &json!({})).unwrap();
        assert!((r_high.value - 12880.0).abs() < 1e-6);
    }

    #[test]
    fn temperature_compensation_reduces_reading_above_reference() {
        let uncompensated = Ec.process(4095.0, &json!({}), &json!({})).unwrap();
        let compensated = Ec
            .process(4095.0, &json!({}), &json!({"temperature_c": 35.0}))
            .unwrap();
        assert!(compensated.value < uncompensated.value);
    }

    #[test]
    fn unit_conversion_to_ms_cm() {
        let r = Ec.process(4095.0, &json!({}), &json!({"unit": "ms_cm"})).unwrap();
        assert!((r.value - 12.88).abs() < 1e-6);
        assert_eq!(r.unit, "mS/cm");
    }
}
