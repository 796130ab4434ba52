//! Request/response correlation for actuator commands: the Logic Engine
//! publishes a command with a `request_id` and waits (bounded) for the
//! matching `actuator/response` to arrive on a different dispatcher task.
//! Grounded on the oneshot-channel request/response correlation pattern used
//! by the pack's `aws_iot`-style MQTT client (`other_examples/1bcf91ea_...`),
//! keyed here by `request_id` instead of a shadow client message id.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

#[derive(Default)]
pub struct ResponseWaiterRegistry {
    waiters: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl ResponseWaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `request_id`'s eventual response. Dropping the
    /// returned receiver without awaiting it is fine; `resolve` on an
    /// abandoned request_id is a no-op.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(request_id.to_string(), tx);
        rx
    }

    /// Called by the actuator-response handler. Returns `false` if nobody
    /// was waiting (e.g. the caller already timed out).
    pub fn resolve(&self, request_id: &str, payload: Value) -> bool {
        if let Some(tx) = self.waiters.lock().unwrap().remove(request_id) {
            tx.send(payload).is_ok()
        } else {
            false
        }
    }

    /// Drop a registration without resolving it, e.g. after a local timeout
    /// so the map doesn't grow unboundedly for responses that never arrive.
    pub fn abandon(&self, request_id: &str) {
        self.waiters.lock().unwrap().remove(request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_payload_to_waiter() {
        let reg = ResponseWaiterRegistry::new();
        let rx = reg.register("req-1");
        assert!(reg.resolve("req-1", json!({"success": true})));
        let payload = rx.await.unwrap();
        assert_eq!(payload["success"], true);
    }

    #[test]
    fn resolve_on_unknown_request_id_is_a_no_op() {
        let reg = ResponseWaiterRegistry::new();
        assert!(!reg.resolve("ghost", json!({})));
    }

    #[tokio::test]
    async fn abandon_drops_the_waiter() {
        let reg = ResponseWaiterRegistry::new();
        let _rx = reg.register("req-2");
        reg.abandon("req-2");
        assert!(!reg.resolve("req-2", json!({})));
    }
}
