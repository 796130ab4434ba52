//! Logic Engine (spec.md §4.8): the cross-device automation core. Two entry
//! points — event-driven `evaluate_sensor_data` (fired by the sensor
//! pipeline) and timer-driven `evaluate_timers` (fired by the Scheduler
//! every 60s) — both run the same per-rule pipeline: cooldown, 3-tier rate,
//! condition tree, conflict acquisition, sequential action execution,
//! history log, lock release. Grounded structurally on the teacher
//! `scheduler.rs`'s per-zone state machine (one evaluation function walking
//! a list of configured entities, gated by cooldown/limits before acting),
//! generalized from one hardcoded watering decision to an arbitrary rule
//! tree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use serde_json::json;
use time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit;
use crate::clock::Clock;
use crate::db::{Db, LogicRule, RuleExecutionInput};
use crate::error::KaiserError;
use crate::logic::action::{Action, ActuatorCommandKind};
use crate::logic::condition::{self, TriggerEvent};
use crate::logic::conflict::{AcquireOutcome, ConflictManager, ResourceKey};
use crate::logic::ratelimit::{EngineRateLimiter, SlidingWindowLimiter};
use crate::mqtt::{KaiserMqtt, TopicCategory};
use crate::response_waiter::ResponseWaiterRegistry;
use crate::ws::WsManager;

/// Bounded wait for an actuator's `actuator/response` echo before treating
/// the action as fire-and-forget, per spec.md §4.8 step 5.
const ACTUATOR_RESPONSE_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const CONFLICT_LOCK_TTL_SEC: i64 = 60;

pub struct LogicEngine {
    db: Db,
    mqtt: KaiserMqtt,
    ws: WsManager,
    clock: Arc<dyn Clock>,
    conflicts: ConflictManager,
    rate: EngineRateLimiter,
    per_rule_limiters: Mutex<HashMap<i64, SlidingWindowLimiter>>,
    pub response_waiters: Arc<ResponseWaiterRegistry>,
}

impl LogicEngine {
    pub fn new(
        db: Db,
        mqtt: KaiserMqtt,
        ws: WsManager,
        clock: Arc<dyn Clock>,
        global_per_sec: usize,
        per_device_per_sec: usize,
        response_waiters: Arc<ResponseWaiterRegistry>,
    ) -> Self {
        Self {
            db,
            mqtt,
            ws,
            clock,
            conflicts: ConflictManager::new(Duration::seconds(CONFLICT_LOCK_TTL_SEC)),
            rate: EngineRateLimiter::new(global_per_sec, per_device_per_sec),
            per_rule_limiters: Mutex::new(HashMap::new()),
            response_waiters,
        }
    }

    /// Event-driven entry point: called by the sensor pipeline as a
    /// detached background task (spec.md §4.5 step 8 — "do not await").
    pub async fn evaluate_sensor_data(&self, device_id: &str, gpio: i64, sensor_type: &str, value: f64) {
        let rules = match self.db.get_rules_by_trigger(device_id, gpio, sensor_type).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, device_id, gpio, "failed to load triggered rules");
                return;
            }
        };
        let trigger = TriggerEvent {
            device_id: device_id.to_string(),
            gpio,
            sensor_type: sensor_type.to_string(),
            value,
        };
        for rule in rules {
            self.run_rule(rule, Some(&trigger)).await;
        }
    }

    /// Timer-driven entry point: called by the Scheduler every 60s for
    /// every rule whose condition tree contains a time predicate.
    pub async fn evaluate_timers(&self) {
        let rules = match self.db.get_timer_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "failed to load timer rules");
                return;
            }
        };
        for rule in rules {
            self.run_rule(rule, None).await;
        }
    }

    /// Drop expired conflict locks; intended to be called from the
    /// Scheduler alongside `evaluate_timers`.
    pub fn sweep_conflicts(&self) {
        self.conflicts.sweep(self.clock.as_ref());
    }

    async fn run_rule(&self, rule: LogicRule, trigger: Option<&TriggerEvent>) {
        let rule_id = rule.id;
        let start = self.clock.now();

        if !self.cooldown_elapsed(&rule) {
            return;
        }

        let target_device = trigger
            .map(|t| t.device_id.clone())
            .or_else(|| rule.triggers.first().map(|t| t.device_id.clone()))
            .unwrap_or_default();

        if !self.rate.allow(self.clock.as_ref(), &target_device) {
            return;
        }
        if !self.per_rule_allow(&rule) {
            return;
        }

        let condition_result = condition::evaluate(&rule.conditions, &self.db, self.clock.as_ref(), trigger).await;
        let matched = match condition_result {
            Ok(matched) => matched,
            Err(e) => {
                audit::record_error(&self.db, &self.ws, self.clock.as_ref(), &e, None, None).await;
                return;
            }
        };
        if !matched {
            return;
        }

        let trigger_data = trigger
            .map(|t| json!({"deviceId": t.device_id, "gpio": t.gpio, "sensorType": t.sensor_type, "value": t.value}).to_string())
            .unwrap_or_else(|| "timer".to_string());

        let held_resources = self.acquire_resources(&rule).await;
        let (success, actions_summary, error_message) = self.execute_actions(&rule, held_resources.as_slice()).await;
        for (resource, _) in &held_resources {
            self.conflicts.release(resource, rule_id);
        }

        let duration_ms = (self.clock.now() - start).whole_milliseconds() as i64;
        let exec = RuleExecutionInput {
            rule_id,
            timestamp: self.clock.unix(),
            trigger_data: &trigger_data,
            actions_summary: &actions_summary,
            success,
            duration_ms,
            error_message: error_message.as_deref(),
        };
        if let Err(e) = self.db.log_execution(&exec).await {
            warn!(error = %e, rule_id, "failed to log rule execution");
        }
        if let Err(e) = self.db.mark_rule_executed(rule_id, self.clock.unix()).await {
            warn!(error = %e, rule_id, "failed to mark rule executed");
        }
        self.ws.broadcast(
            "logic_execution",
            json!({"ruleId": rule_id, "ruleName": rule.name, "success": success, "durationMs": duration_ms}),
        );
        info!(rule_id, rule = %rule.name, success, "rule evaluated");
    }

    fn cooldown_elapsed(&self, rule: &LogicRule) -> bool {
        match rule.last_executed {
            None => true,
            Some(last) => self.clock.unix() - last >= rule.cooldown_sec,
        }
    }

    fn per_rule_allow(&self, rule: &LogicRule) -> bool {
        let mut limiters = self.per_rule_limiters.lock().unwrap();
        let limiter = limiters
            .entry(rule.id)
            .or_insert_with(|| SlidingWindowLimiter::new(Duration::hours(1), rule.max_executions_per_hour.max(0) as usize));
        limiter.check(self.clock.as_ref(), "rule")
    }

    /// Acquires a conflict lock for every actuator resource this rule's
    /// actions touch. Resources whose lock we fail to get are simply
    /// skipped at execution time (§4.8 step 5 treats per-action conflict
    /// failure as a soft skip, not an abort of the whole rule, unless the
    /// action is `required`). Each granted lock's cancellation token is kept
    /// so the action loop can abort cleanly if we're pre-empted mid-run.
    async fn acquire_resources(&self, rule: &LogicRule) -> Vec<(ResourceKey, tokio_util::sync::CancellationToken)> {
        let mut held = Vec::new();
        for action in &rule.actions {
            if let Action::ActuatorCommand { device_id, gpio, .. } = action {
                let resource: ResourceKey = (device_id.clone(), *gpio);
                let (outcome, token) = self.conflicts.acquire(
                    self.clock.as_ref(),
                    resource.clone(),
                    rule.id,
                    rule.priority,
                    rule.safety_critical,
                );
                match outcome {
                    AcquireOutcome::Granted => held.push((resource, token)),
                    AcquireOutcome::Preempted { previous_rule_id } => {
                        warn!(rule_id = rule.id, previous_rule_id, device_id, gpio, "pre-empted lower-priority rule");
                        held.push((resource, token));
                    }
                    AcquireOutcome::Blocked => {
                        let err = KaiserError::ConflictBlocked {
                            device_id: device_id.clone(),
                            gpio: *gpio,
                        };
                        audit::record_error(&self.db, &self.ws, self.clock.as_ref(), &err, Some(device_id.clone()), Some(*gpio)).await;
                    }
                }
            }
        }
        held
    }

    /// Runs every action in order; per spec.md §4.8's failure policy, a
    /// non-required action's failure is logged and the rule continues. A
    /// lock pre-empted by a higher-priority or safety-critical rule aborts
    /// the remaining actions.
    async fn execute_actions(
        &self,
        rule: &LogicRule,
        held_resources: &[(ResourceKey, tokio_util::sync::CancellationToken)],
    ) -> (bool, String, Option<String>) {
        let mut summaries = Vec::with_capacity(rule.actions.len());
        let mut overall_success = true;
        let mut first_error: Option<String> = None;

        for action in &rule.actions {
            if let Action::ActuatorCommand { device_id, gpio, .. } = action {
                let resource: ResourceKey = (device_id.clone(), *gpio);
                match held_resources.iter().find(|(r, _)| r == &resource) {
                    None => {
                        summaries.push(format!("{device_id}/{gpio}: skipped (conflict)"));
                        continue;
                    }
                    Some((_, token)) if token.is_cancelled() => {
                        summaries.push(format!("{device_id}/{gpio}: aborted (pre-empted)"));
                        overall_success = false;
                        first_error.get_or_insert_with(|| "preempted".to_string());
                        break;
                    }
                    Some(_) => {}
                }
            }
            match self.execute_action(action, rule).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    let required = matches!(action, Action::ActuatorCommand { required: true, .. });
                    summaries.push(format!("failed: {e}"));
                    if first_error.is_none() {
                        first_error = Some(e.to_string());
                    }
                    if required {
                        overall_success = false;
                        audit::record_error(&self.db, &self.ws, self.clock.as_ref(), &e, None, None).await;
                        break;
                    }
                    audit::record_error(&self.db, &self.ws, self.clock.as_ref(), &e, None, None).await;
                }
            }
        }

        (overall_success, summaries.join("; "), first_error)
    }

    async fn execute_action(&self, action: &Action, rule: &LogicRule) -> Result<String, KaiserError> {
        match action {
            Action::ActuatorCommand {
                device_id,
                gpio,
                command,
                value,
                duration_s,
                ..
            } => self.execute_actuator_command(device_id, *gpio, *command, *value, *duration_s).await,
            Action::Delay { ms } => {
                tokio::time::sleep(StdDuration::from_millis(*ms)).await;
                Ok(format!("delay {ms}ms"))
            }
            Action::Notification { event_type, message } => {
                self.ws.broadcast(event_type, json!({"message": message, "ruleId": rule.id}));
                Ok(format!("notification {event_type}"))
            }
        }
    }

    async fn execute_actuator_command(
        &self,
        device_id: &str,
        gpio: i64,
        command: ActuatorCommandKind,
        value: f64,
        duration_s: Option<i64>,
    ) -> Result<String, KaiserError> {
        let request_id = Uuid::new_v4().to_string();
        let topic = self.mqtt.codec.build_actuator_command(device_id, gpio);
        let payload = json!({
            "command": command.as_str(),
            "value": value,
            "duration_s": duration_s,
            "request_id": request_id,
            "timestamp": self.clock.unix(),
        });
        let body = serde_json::to_vec(&payload).map_err(|e| KaiserError::Validation(e.to_string()))?;

        let waiter = self.response_waiters.register(&request_id);
        self.mqtt.publish(&topic, TopicCategory::Other, body, false).await;

        match tokio::time::timeout(ACTUATOR_RESPONSE_TIMEOUT, waiter).await {
            Ok(Ok(response)) => {
                let success = response.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
                if success {
                    Ok(format!("{device_id}/{gpio}: {} acked", command.as_str()))
                } else {
                    Err(KaiserError::Validation(format!(
                        "{device_id}/{gpio} rejected command: {}",
                        response.get("message").and_then(|v| v.as_str()).unwrap_or("unknown")
                    )))
                }
            }
            Ok(Err(_)) | Err(_) => {
                self.response_waiters.abandon(&request_id);
                Ok(format!("{device_id}/{gpio}: {} sent, no response within timeout", command.as_str()))
            }
        }
    }
}
