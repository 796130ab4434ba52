//! Topic Codec: builds and parses `kaiser/<kaiserId>/esp/<deviceId>/...`
//! topics, and matches subscription patterns (`+`/`#`) against concrete
//! topics. Generalizes the teacher's `mqtt.rs` `extract_node_id`/
//! `extract_zone_id` single-purpose parsers into one codec covering every
//! topic category in the catalogue.

use crate::error::KaiserError;

/// A parsed inbound topic, one variant per row of the inbound catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    SensorData { device_id: String, gpio: i64 },
    ActuatorStatus { device_id: String, gpio: i64 },
    ActuatorResponse { device_id: String, gpio: i64 },
    ActuatorAlert { device_id: String, gpio: i64 },
    Heartbeat { device_id: String },
    Diagnostics { device_id: String },
    ConfigResponse { device_id: String },
    ZoneAck { device_id: String },
    SubzoneAck { device_id: String },
    Lwt { device_id: String },
}

/// Subscription patterns the dispatcher registers against, in first-match-wins
/// order (spec.md §4.4 step 2).
pub const SUBSCRIPTIONS: &[&str] = &[
    "esp/+/sensor/+/data",
    "esp/+/actuator/+/status",
    "esp/+/actuator/+/response",
    "esp/+/actuator/+/alert",
    "esp/+/system/heartbeat",
    "esp/+/system/diagnostics",
    "esp/+/config_response",
    "esp/+/zone/ack",
    "esp/+/subzone/ack",
    "esp/+/lwt",
];

pub struct TopicCodec {
    kaiser_id: String,
}

impl TopicCodec {
    pub fn new(kaiser_id: impl Into<String>) -> Self {
        Self {
            kaiser_id: kaiser_id.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("kaiser/{}/", self.kaiser_id)
    }

    /// Absolute subscription filter for a catalogue pattern (prefixes with
    /// `kaiser/<kaiserId>/`).
    pub fn subscription(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix(), suffix)
    }

    pub fn build_actuator_command(&self, device_id: &str, gpio: i64) -> String {
        format!("{}esp/{}/actuator/{}/command", self.prefix(), device_id, gpio)
    }

    pub fn build_sensor_command(&self, device_id: &str, gpio: i64) -> String {
        format!("{}esp/{}/sensor/{}/command", self.prefix(), device_id, gpio)
    }

    pub fn build_sensor_processed(&self, device_id: &str, gpio: i64) -> String {
        format!("{}esp/{}/sensor/{}/processed", self.prefix(), device_id, gpio)
    }

    pub fn build_config(&self, device_id: &str) -> String {
        format!("{}esp/{}/config", self.prefix(), device_id)
    }

    pub fn build_zone_assign(&self, device_id: &str) -> String {
        format!("{}esp/{}/zone/assign", self.prefix(), device_id)
    }

    pub fn build_subzone_assign(&self, device_id: &str) -> String {
        format!("{}esp/{}/subzone/assign", self.prefix(), device_id)
    }

    pub fn build_status(&self) -> String {
        format!("{}status", self.prefix())
    }

    pub fn build_emergency(&self) -> String {
        format!("{}broadcast/emergency", self.prefix())
    }

    /// Parse an inbound topic, stripping the `kaiser/<kaiserId>/` prefix
    /// first. Returns `TopicParseError` on anything that doesn't match the
    /// catalogue.
    pub fn parse(&self, topic: &str) -> Result<InboundTopic, KaiserError> {
        let prefix = self.prefix();
        let rest = topic
            .strip_prefix(&prefix)
            .ok_or_else(|| KaiserError::TopicParse(format!("missing kaiser prefix: {topic}")))?;
        let parts: Vec<&str> = rest.split('/').collect();

        match parts.as_slice() {
            ["esp", device_id, "sensor", gpio, "data"] => Ok(InboundTopic::SensorData {
                device_id: device_id.to_string(),
                gpio: parse_gpio(gpio)?,
            }),
            ["esp", device_id, "actuator", gpio, "status"] => Ok(InboundTopic::ActuatorStatus {
                device_id: device_id.to_string(),
                gpio: parse_gpio(gpio)?,
            }),
            ["esp", device_id, "actuator", gpio, "response"] => Ok(InboundTopic::ActuatorResponse {
                device_id: device_id.to_string(),
                gpio: parse_gpio(gpio)?,
            }),
            ["esp", device_id, "actuator", gpio, "alert"] => Ok(InboundTopic::ActuatorAlert {
                device_id: device_id.to_string(),
                gpio: parse_gpio(gpio)?,
            }),
            ["esp", device_id, "system", "heartbeat"] => Ok(InboundTopic::Heartbeat {
                device_id: device_id.to_string(),
            }),
            ["esp", device_id, "system", "diagnostics"] => Ok(InboundTopic::Diagnostics {
                device_id: device_id.to_string(),
            }),
            ["esp", device_id, "config_response"] => Ok(InboundTopic::ConfigResponse {
                device_id: device_id.to_string(),
            }),
            ["esp", device_id, "zone", "ack"] => Ok(InboundTopic::ZoneAck {
                device_id: device_id.to_string(),
            }),
            ["esp", device_id, "subzone", "ack"] => Ok(InboundTopic::SubzoneAck {
                device_id: device_id.to_string(),
            }),
            ["esp", device_id, "lwt"] => Ok(InboundTopic::Lwt {
                device_id: device_id.to_string(),
            }),
            _ => Err(KaiserError::TopicParse(format!("unrecognized topic: {topic}"))),
        }
    }
}

fn parse_gpio(s: &str) -> Result<i64, KaiserError> {
    s.parse::<i64>()
        .map_err(|_| KaiserError::TopicParse(format!("invalid gpio segment: {s}")))
}

/// Exact-prefix matching with positional `+`/`#` wildcards, case-sensitive.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let top: Vec<&str> = topic.split('/').collect();

    let mut pi = 0;
    let mut ti = 0;
    while pi < pat.len() {
        match pat[pi] {
            "#" => return true,
            "+" => {
                if ti >= top.len() {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
            literal => {
                if ti >= top.len() || top[ti] != literal {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
        }
    }
    pi == pat.len() && ti == top.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TopicCodec {
        TopicCodec::new("god")
    }

    #[test]
    fn build_and_parse_round_trip_sensor_data() {
        let c = codec();
        let built = format!("{}esp/ESP_ABCDEF01/sensor/34/data", c.prefix());
        let parsed = c.parse(&built).unwrap();
        assert_eq!(
            parsed,
            InboundTopic::SensorData {
                device_id: "ESP_ABCDEF01".into(),
                gpio: 34
            }
        );
    }

    #[test]
    fn round_trips_every_inbound_category() {
        let c = codec();
        let cases = [
            "kaiser/god/esp/E1/sensor/1/data",
            "kaiser/god/esp/E1/actuator/1/status",
            "kaiser/god/esp/E1/actuator/1/response",
            "kaiser/god/esp/E1/actuator/1/alert",
            "kaiser/god/esp/E1/system/heartbeat",
            "kaiser/god/esp/E1/system/diagnostics",
            "kaiser/god/esp/E1/config_response",
            "kaiser/god/esp/E1/zone/ack",
            "kaiser/god/esp/E1/subzone/ack",
            "kaiser/god/esp/E1/lwt",
        ];
        for topic in cases {
            assert!(c.parse(topic).is_ok(), "failed to parse {topic}");
        }
    }

    #[test]
    fn build_outbound_topics() {
        let c = codec();
        assert_eq!(
            c.build_actuator_command("ESP_1", 16),
            "kaiser/god/esp/ESP_1/actuator/16/command"
        );
        assert_eq!(c.build_emergency(), "kaiser/god/broadcast/emergency");
    }

    #[test]
    fn rejects_missing_prefix_and_unknown_shape() {
        let c = codec();
        assert!(c.parse("esp/E1/sensor/1/data").is_err());
        assert!(c.parse("kaiser/god/esp/E1/bogus").is_err());
    }

    #[test]
    fn wildcard_single_level() {
        assert!(matches("esp/+/sensor/+/data", "esp/ESP_1/sensor/34/data"));
        assert!(!matches("esp/+/sensor/+/data", "esp/ESP_1/sensor/34/35/data"));
    }

    #[test]
    fn wildcard_multi_level() {
        assert!(matches("esp/#", "esp/ESP_1/sensor/34/data"));
        assert!(matches("esp/#", "esp/ESP_1"));
    }

    #[test]
    fn case_sensitive() {
        assert!(!matches("esp/+/lwt", "ESP/e1/lwt"));
    }
}
