use serde_json::{json, Value};

use super::{default_validate, ProcessResult, Processor, ValidateResult};

/// Like the SHT31, BMP280 surfaces pressure and temperature as two registry
/// entries. Pressure supports an optional sea-level correction via
/// `params.sea_level_hpa`.
pub struct Bmp280Pressure;
pub struct Bmp280Temp;

const PRESSURE_RANGE: (f64, f64) = (300.0, 1100.0);
const TEMP_RANGE: (f64, f64) = (-40.0, 85.0);

impl Processor for Bmp280Pressure {
    fn sensor_type(&self) -> &'static str {
        "bmp280_pressure"
    }

    fn process(&self, raw: f64, _calibration: &Value, params: &Value) -> Result<ProcessResult, String> {
        let sea_level_hpa = params.get("sea_level_hpa").and_then(Value::as_f64);
        let mut metadata = json!({});
        if let Some(sea_level) = sea_level_hpa {
            // Barometric formula, altitude in meters from a station reading.
            let altitude_m = 44330.0 * (1.0 - (raw / sea_level).powf(1.0 / 5.255));
            metadata = json!({"altitude_m": altitude_m});
        }
        Ok(ProcessResult {
            value: raw.clamp(PRESSURE_RANGE.0, PRESSURE_RANGE.1),
            unit: "hPa".into(),
            quality: "good".into(),
            metadata,
        })
    }

    fn default_params(&self) -> Value {
        json!({})
    }

    fn validate(&self, raw: f64) -> ValidateResult {
        default_validate(raw, PRESSURE_RANGE)
    }

    fn value_range(&self) -> (f64, f64) {
        PRESSURE_RANGE
    }

    fn raw_value_range(&self) -> (f64, f64) {
        PRESSURE_RANGE
    }
}

impl Processor for Bmp280Temp {
    fn sensor_type(&self) -> &'static str {
        "bmp280_temp"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_without_sea_level_has_no_altitude() {
        let r = Bmp280Pressure.process(1013.25, &json!({}), &json!({})).unwrap();
        assert_eq!(r.metadata, json!({}));
    }

    #[test]
    fn pressure_with_sea_level_computes_altitude() {
        let r = Bmp280Pressure
            .process(1013.25, &json!({}), &json!({"sea_level_hpa": 1013.25}))
            .unwrap();
        let altitude = r.metadata["altitude_m"].as_f64().unwrap();
        assert!(altitude.abs() < 1.0);
    }
}
