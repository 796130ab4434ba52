//! HTTP/WS entry point (spec.md §4.11, §6): an `axum::Router` exposing the
//! WebSocket upgrade plus a couple of read-only status endpoints. Grounded
//! on teacher `web.rs`'s `AppState`/`router`/`serve` shape; the dashboard
//! route (`include_str!("ui/index.html")`) is dropped rather than stubbed,
//! since this system has no browser UI in scope (spec.md §1 Non-goals) and
//! no such asset exists to adapt.

use std::net::SocketAddr;

use axum::extract::{FromRef, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::db::Db;
use crate::dispatch::Dispatcher;
use crate::mqtt::KaiserMqtt;
use crate::ws::{self, WsManager};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub mqtt: KaiserMqtt,
    pub ws: WsManager,
    pub dispatcher: Dispatcher,
}

impl FromRef<AppState> for WsManager {
    fn from_ref(state: &AppState) -> Self {
        state.ws.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::upgrade_handler))
        .route("/api/status", get(api_status))
        .route("/api/devices", get(api_devices))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.db.health_check().await.is_ok();
    Json(serde_json::json!({
        "mqttBreaker": format!("{:?}", state.mqtt.breaker_state()),
        "offlineBufferLen": state.mqtt.offline_buffer_len(),
        "dbHealthy": db_ok,
        "handlerCounts": dispatcher_counts_json(&state.dispatcher),
    }))
}

fn dispatcher_counts_json(dispatcher: &Dispatcher) -> serde_json::Value {
    let counts = dispatcher.counters();
    serde_json::json!(counts
        .into_iter()
        .map(|(label, c)| (label.to_string(), serde_json::json!({"success": c.success, "failure": c.failure})))
        .collect::<std::collections::HashMap<_, _>>())
}

async fn api_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.load_devices().await {
        Ok(devices) => Json(serde_json::json!(devices)),
        Err(e) => {
            tracing::error!(error = %e, "api_devices failed");
            Json(serde_json::json!({"error": e.to_string()}))
        }
    }
}

pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind web port");

    tracing::info!(%addr, "web/ws listening");
    axum::serve(listener, router(state)).await.expect("web server error");
}
