//! MQTT Client & Offline Buffer (spec.md §4.2): one process-wide connection
//! wrapping [`rumqttc::AsyncClient`] with breaker-gated publish and an
//! [`OfflineBuffer`] for replay on reconnect. Grounded on the teacher
//! `main.rs` MQTT setup block (`MqttOptions`, `LastWill`, credential
//! handling, initial subscribes) and the teacher's `Instant`-based grace
//! period, now generalized into [`CircuitBreaker`].

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};
use tracing::{info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::offline_buffer::{BufferedPublish, OfflineBuffer, QosKind};
use crate::topic::{InboundTopic, TopicCodec, SUBSCRIPTIONS};

/// Topic category, used only to pick the fixed QoS policy of spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCategory {
    Heartbeat,
    ConfigAck,
    Other,
}

impl TopicCategory {
    pub fn qos(self) -> QosKind {
        match self {
            TopicCategory::Heartbeat => QosKind::AtMostOnce,
            TopicCategory::ConfigAck => QosKind::ExactlyOnce,
            TopicCategory::Other => QosKind::AtLeastOnce,
        }
    }
}

/// Process-wide MQTT connection: `AsyncClient` + breaker + offline buffer.
/// Constructed once in `main`, cloned (the inner client is itself `Clone`)
/// and threaded to every task that needs to publish.
#[derive(Clone)]
pub struct KaiserMqtt {
    client: AsyncClient,
    breaker: std::sync::Arc<CircuitBreaker>,
    buffer: std::sync::Arc<OfflineBuffer>,
    pub codec: std::sync::Arc<TopicCodec>,
}

impl KaiserMqtt {
    /// Builds `MqttOptions` from environment and connects, returning the
    /// wrapper plus the raw `EventLoop` the caller polls in the main select
    /// loop. Mirrors the teacher's `main.rs` options block: keep-alive,
    /// clean-session, LWT, optional credentials, optional TLS.
    pub fn connect(kaiser_id: &str, offline_buffer_capacity: usize) -> Result<(Self, EventLoop)> {
        let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = env::var("MQTT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1883);

        let client_id = env::var("KAISER_CLIENT_ID").unwrap_or_else(|_| format!("kaiser-{kaiser_id}"));
        let mut opts = MqttOptions::new(client_id, &broker, port);
        opts.set_keep_alive(Duration::from_secs(30));
        opts.set_clean_session(false);

        let codec = TopicCodec::new(kaiser_id);
        opts.set_last_will(LastWill::new(
            codec.build_status(),
            b"offline".to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        if let (Ok(user), Ok(pass)) = (env::var("MQTT_USER"), env::var("MQTT_PASS")) {
            opts.set_credentials(user, pass);
            info!("mqtt: using password authentication");
        } else {
            warn!("MQTT_USER / MQTT_PASS not set — connecting in anonymous mode");
        }

        if let Ok(ca_path) = env::var("MQTT_TLS_CA") {
            let ca = std::fs::read(&ca_path).with_context(|| format!("reading MQTT_TLS_CA at {ca_path}"))?;
            let client_auth = match (env::var("MQTT_TLS_CERT"), env::var("MQTT_TLS_KEY")) {
                (Ok(cert_path), Ok(key_path)) => {
                    let cert = std::fs::read(&cert_path).with_context(|| format!("reading MQTT_TLS_CERT at {cert_path}"))?;
                    let key = std::fs::read(&key_path).with_context(|| format!("reading MQTT_TLS_KEY at {key_path}"))?;
                    Some((cert, key))
                }
                _ => None,
            };
            opts.set_transport(rumqttc::Transport::tls(ca, client_auth, None));
            info!("mqtt: TLS enabled");
        } else if env::var("MQTT_TLS_INSECURE").as_deref() == Ok("true") {
            warn!("mqtt: MQTT_TLS_INSECURE set with no CA configured — falling back to an unverified transport is not implemented; set MQTT_TLS_CA instead");
        }

        let (client, eventloop) = AsyncClient::new(opts, 100);

        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let buffer = OfflineBuffer::new(offline_buffer_capacity);

        Ok((
            Self {
                client,
                breaker: std::sync::Arc::new(breaker),
                buffer: std::sync::Arc::new(buffer),
                codec: std::sync::Arc::new(codec),
            },
            eventloop,
        ))
    }

    /// Issues every catalogue subscription (spec.md §6.1), re-issued on
    /// every `ConnAck` by the caller.
    pub async fn subscribe_all(&self) -> Result<()> {
        for suffix in SUBSCRIPTIONS {
            let qos = if *suffix == "esp/+/system/heartbeat" {
                QoS::AtMostOnce
            } else if *suffix == "esp/+/config_response" {
                QoS::ExactlyOnce
            } else {
                QoS::AtLeastOnce
            };
            let topic = self.codec.subscription(suffix);
            self.client
                .subscribe(&topic, qos)
                .await
                .with_context(|| format!("subscribing to {topic}"))?;
        }
        info!(count = SUBSCRIPTIONS.len(), "mqtt: subscriptions issued");
        Ok(())
    }

    /// Publish path per spec.md §4.2: breaker-gated, buffer-on-deny,
    /// success/failure recorded on the breaker, failure also buffers.
    /// Returns `true` if the publish was actually attempted and accepted by
    /// the client, `false` if it was enqueued into the offline buffer
    /// instead.
    pub async fn publish(&self, topic: &str, category: TopicCategory, payload: Vec<u8>, retain: bool) -> bool {
        let qos = category.qos();

        if !self.breaker.allow_request() {
            self.buffer.push(BufferedPublish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            return false;
        }

        match self.client.publish(topic, qos.into(), retain, payload.clone()).await {
            Ok(()) => {
                self.breaker.record_success();
                true
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(topic, error = %e, "mqtt publish failed, buffering for replay");
                self.buffer.push(BufferedPublish {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retain,
                });
                false
            }
        }
    }

    /// Replay everything queued in the offline buffer, in FIFO order.
    /// Called after a reconnect (`ConnAck`). Stops early and re-buffers the
    /// remainder if the breaker trips again mid-replay.
    pub async fn replay_offline_buffer(&self) {
        let pending = self.buffer.drain();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "mqtt: replaying offline buffer");
        for item in pending {
            if !self.breaker.allow_request() {
                self.buffer.push(item);
                continue;
            }
            match self
                .client
                .publish(&item.topic, item.qos.into(), item.retain, item.payload.clone())
                .await
            {
                Ok(()) => self.breaker.record_success(),
                Err(e) => {
                    self.breaker.record_failure();
                    warn!(topic = %item.topic, error = %e, "replay publish failed, re-buffering");
                    self.buffer.push(item);
                }
            }
        }
    }

    pub fn offline_buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn offline_buffer_snapshot(&self) -> Vec<BufferedPublish> {
        self.buffer.snapshot()
    }

    pub fn breaker_state(&self) -> crate::breaker::BreakerState {
        self.breaker.state()
    }

    /// Publish-path breaker, exposed for status reporting and for fault
    /// injection in integration tests simulating a broker outage.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn parse_topic(&self, topic: &str) -> Result<InboundTopic, crate::error::KaiserError> {
        self.codec.parse(topic)
    }
}
