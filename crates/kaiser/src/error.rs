//! Domain error taxonomy. Every non-fatal variant is both logged and, via
//! [`crate::audit::record`], mirrored as an `audit_event` for operator UIs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KaiserError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("topic parse failed: {0}")]
    TopicParse(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("no processor registered for sensor type {0}")]
    ProcessorMissing(String),

    #[error("processor {sensor_type} failed: {reason}")]
    ProcessorFailure { sensor_type: String, reason: String },

    #[error("database unavailable")]
    DbUnavailable,

    #[error("mqtt publish failed: {0}")]
    MqttPublishFailure(String),

    #[error("actuator {device_id}/{gpio} held by a higher-priority rule")]
    ConflictBlocked { device_id: String, gpio: i64 },

    #[error("safety-critical rule pre-empted holder on {device_id}/{gpio}")]
    SafetyPreempted { device_id: String, gpio: i64 },

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl KaiserError {
    /// Severity used for the audit trail, per spec.md §7's policy table.
    pub fn severity(&self) -> crate::db::AuditSeverity {
        use crate::db::AuditSeverity::*;
        match self {
            KaiserError::Validation(_) => Warning,
            KaiserError::TopicParse(_) => Warning,
            KaiserError::UnknownDevice(_) => Info,
            KaiserError::ProcessorMissing(_) => Error,
            KaiserError::ProcessorFailure { .. } => Error,
            KaiserError::DbUnavailable => Critical,
            KaiserError::MqttPublishFailure(_) => Warning,
            KaiserError::ConflictBlocked { .. } => Info,
            KaiserError::SafetyPreempted { .. } => Warning,
            KaiserError::RateLimitExceeded(_) => Info,
            KaiserError::Timeout(_) => Warning,
            KaiserError::Configuration(_) => Critical,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            KaiserError::Validation(_) => "validation_error",
            KaiserError::TopicParse(_) => "topic_parse_error",
            KaiserError::UnknownDevice(_) => "unknown_device",
            KaiserError::ProcessorMissing(_) => "processor_missing",
            KaiserError::ProcessorFailure { .. } => "processor_failure",
            KaiserError::DbUnavailable => "db_unavailable",
            KaiserError::MqttPublishFailure(_) => "mqtt_publish_failure",
            KaiserError::ConflictBlocked { .. } => "conflict_blocked",
            KaiserError::SafetyPreempted { .. } => "safety_preempted",
            KaiserError::RateLimitExceeded(_) => "rate_limit_exceeded",
            KaiserError::Timeout(_) => "timeout",
            KaiserError::Configuration(_) => "configuration_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_matches_policy_table() {
        assert_eq!(
            KaiserError::DbUnavailable.severity(),
            crate::db::AuditSeverity::Critical
        );
        assert_eq!(
            KaiserError::UnknownDevice("ESP_1".into()).severity(),
            crate::db::AuditSeverity::Info
        );
    }
}
