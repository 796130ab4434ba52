//! Action schema. New code, grounded on the teacher's `mqtt.publish(...)`
//! call sites in `scheduler.rs`'s `handle_idle`/`handle_watering` — an
//! actuator command here is the same "publish ON/OFF, remember we did" shape
//! generalized from valves-only to arbitrary `(deviceId, gpio)` actuators.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActuatorCommandKind {
    On,
    Off,
    Pwm,
}

impl ActuatorCommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActuatorCommandKind::On => "ON",
            ActuatorCommandKind::Off => "OFF",
            ActuatorCommandKind::Pwm => "PWM",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    ActuatorCommand {
        device_id: String,
        gpio: i64,
        command: ActuatorCommandKind,
        value: f64,
        duration_s: Option<i64>,
        /// If true, a failure of this action aborts the rest of the rule
        /// (spec.md §4.8's failure policy).
        #[serde(default)]
        required: bool,
    },
    Delay {
        ms: u64,
    },
    Notification {
        event_type: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actuator_command_round_trips_through_json() {
        let action = Action::ActuatorCommand {
            device_id: "ESP_1".into(),
            gpio: 16,
            command: ActuatorCommandKind::Off,
            value: 0.0,
            duration_s: None,
            required: false,
        };
        let json = serde_json::to_string(&action).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        match back {
            Action::ActuatorCommand { command, .. } => assert_eq!(command.as_str(), "OFF"),
            _ => panic!("wrong variant"),
        }
    }
}
