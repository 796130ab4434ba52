//! WebSocket Manager (spec.md §4.11): filtered fan-out to browser clients
//! with a per-client rate limit. Grounded structurally on the split-socket,
//! spawn-send/receive-task, select-to-terminate pattern used across the
//! wider pack's websocket handlers, combined with the teacher's `axum`
//! `Router`/`AppState` idiom from `web.rs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::logic::ratelimit::SlidingWindowLimiter;

/// Outbound envelope, normative per spec.md §6.2 ("`{type, data}`").
#[derive(Debug, Clone, Serialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// Client-declared subscription filter, from spec.md §4.11.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientFilter {
    #[serde(default)]
    pub types: Option<Vec<String>>,
    #[serde(rename = "espIds", default)]
    pub esp_ids: Option<Vec<String>>,
    #[serde(rename = "sensorTypes", default)]
    pub sensor_types: Option<Vec<String>>,
}

impl ClientFilter {
    fn matches(&self, event: &WsEvent) -> bool {
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(esp_ids) = &self.esp_ids {
            if let Some(esp_id) = event.data.get("esp_id").and_then(Value::as_str) {
                if !esp_ids.iter().any(|e| e == esp_id) {
                    return false;
                }
            }
        }
        if let Some(sensor_types) = &self.sensor_types {
            if let Some(sensor_type) = event.data.get("sensorType").and_then(Value::as_str) {
                if !sensor_types.iter().any(|s| s == sensor_type) {
                    return false;
                }
            }
        }
        true
    }
}

const BROADCAST_CAPACITY: usize = 1024;
const PER_CLIENT_RATE_PER_SEC: usize = 10;

/// Process-wide fan-out hub. `broadcast` is non-blocking: it publishes onto
/// an internal channel and returns immediately, regardless of how many
/// clients are connected or how slow their sockets are.
#[derive(Clone)]
pub struct WsManager {
    sender: broadcast::Sender<WsEvent>,
    limiter: Arc<SlidingWindowLimiter>,
    next_client_id: Arc<AtomicU64>,
}

impl WsManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            limiter: Arc::new(SlidingWindowLimiter::new(
                time::Duration::seconds(1),
                PER_CLIENT_RATE_PER_SEC,
            )),
            next_client_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Fire-and-forget publish. A `SendError` just means there are currently
    /// no subscribers; that's not a failure condition.
    pub fn broadcast(&self, event_type: &str, data: Value) {
        let _ = self.sender.send(WsEvent {
            event_type: event_type.to_string(),
            data,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.sender.subscribe()
    }

    /// Test-only subscription handle, used to assert on what `audit::record`
    /// and the handlers broadcast without standing up a real socket. Not
    /// `#[cfg(test)]`-gated since integration tests in `tests/` link this
    /// crate as an ordinary dependency and need it too.
    pub fn broadcast_rx_for_test(&self) -> broadcast::Receiver<WsEvent> {
        self.subscribe()
    }

    fn allocate_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Route handler; registered in `web::router` as `.route("/ws", get(upgrade_handler))`.
/// `AppState` implements `FromRef<AppState> for WsManager` so axum can pull
/// just the manager out of the wider application state.
pub async fn upgrade_handler(ws: WebSocketUpgrade, State(manager): State<WsManager>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: WsManager) {
    let client_id = manager.allocate_client_id();
    let (mut sink, mut stream) = socket.split();
    let mut events = manager.subscribe();
    let limiter = manager.limiter.clone();
    let clock = crate::clock::SystemClock;

    let filter = Arc::new(std::sync::Mutex::new(ClientFilter::default()));
    let filter_for_send = filter.clone();

    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let include = filter_for_send.lock().unwrap().matches(&event);
                    if !include {
                        continue;
                    }
                    if !limiter.check(&clock, &client_id.to_string()) {
                        continue;
                    }
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(client_id, skipped, "ws client lagged, dropping skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Ok(new_filter) = serde_json::from_str::<ClientFilter>(&text) {
                        *filter.lock().unwrap() = new_filter;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!(client_id, "ws client disconnected");
}
