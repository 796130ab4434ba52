//! Message handlers (spec.md §4.5–§4.7): one module per inbound topic
//! category, each a thin function over a shared [`HandlerContext`].
//! Grounded on the teacher `main.rs`'s `handle_telemetry`/
//! `handle_node_status`/`handle_valve_command` functions, generalized from
//! three hardcoded handlers (one per fixed topic the teacher subscribes to)
//! into one handler per catalogue row, each still reading top-to-bottom as a
//! single pipeline the way the teacher's do.

pub mod actuator;
pub mod health;
pub mod heartbeat;
pub mod sensor;

use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::db::Db;
use crate::logic::engine::LogicEngine;
use crate::mqtt::KaiserMqtt;
use crate::processors::ProcessorRegistry;
use crate::response_waiter::ResponseWaiterRegistry;
use crate::ws::WsManager;

/// Everything a handler needs, bundled once in `main` and cloned per
/// dispatcher task — mirrors the teacher's practice of threading `Db` and
/// `AsyncClient` into every handler call rather than reaching for globals.
#[derive(Clone)]
pub struct HandlerContext {
    pub db: Db,
    pub mqtt: KaiserMqtt,
    pub ws: WsManager,
    pub clock: Arc<dyn Clock>,
    pub processors: Arc<ProcessorRegistry>,
    pub logic: Arc<LogicEngine>,
    pub response_waiters: Arc<ResponseWaiterRegistry>,
    /// Guards DB sessions opened from a handler (spec.md §4.5 step 3),
    /// separate from the MQTT breaker already living inside `KaiserMqtt`.
    pub db_breaker: Arc<CircuitBreaker>,
}
