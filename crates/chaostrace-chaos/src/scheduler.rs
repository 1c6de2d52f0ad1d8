//! §4.6 Chaos Scheduler: evaluates a loaded [`ChaosScenario`]'s
//! triggers against intercepted events and fires the matching
//! actions through [`ChaosHooks`]. Grounded on the reference
//! `ChaosScheduler` class's state machine and trigger-evaluation
//! order, restructured around `parking_lot`'s synchronous locks and a
//! `tokio::spawn`'d tick task the way the teacher's own scenario
//! scheduler structures its background task (§10.8 caches the time
//! trigger's jitter once, rather than the reference's re-roll per
//! tick).

use std::sync::Arc;

use chaostrace_model::{
    ChaosEvent, ChaosScenario, ChaosState, ChaosTrigger, EventEnvelope, Occurrence, OccurrenceKeyword, RunId,
    SqlEvent, SqlType, TriggerType,
};
use parking_lot::RwLock;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::warn;

use crate::hooks::{ActionContext, ChaosHooks};

fn sql_type_key(sql_type: SqlType) -> &'static str {
    match sql_type {
        SqlType::Select => "select",
        SqlType::Insert => "insert",
        SqlType::Update => "update",
        SqlType::Delete => "delete",
        SqlType::Create => "create",
        SqlType::Alter => "alter",
        SqlType::Drop => "drop",
        SqlType::Truncate => "truncate",
        SqlType::Grant => "grant",
        SqlType::Revoke => "revoke",
        SqlType::Begin => "begin",
        SqlType::Commit => "commit",
        SqlType::Rollback => "rollback",
        SqlType::Other => "other",
    }
}

type ChaosCallback = dyn Fn(ChaosEvent) + Send + Sync;

struct SchedulerInner {
    scenario: ChaosScenario,
    hooks: Arc<ChaosHooks>,
    state: RwLock<Option<ChaosState>>,
    tick_handle: RwLock<Option<JoinHandle<()>>>,
    callback: RwLock<Option<Arc<ChaosCallback>>>,
}

/// One running (or idle) instance of a chaos scenario against a
/// single run. IDLE -> RUNNING on [`ChaosScheduler::start`], RUNNING
/// -> STOPPED on [`ChaosScheduler::stop`]; `is_running` distinguishes
/// the two.
#[derive(Clone)]
pub struct ChaosScheduler {
    inner: Arc<SchedulerInner>,
}

impl ChaosScheduler {
    /// Load a scenario against a hook effector. Fails loudly (rather
    /// than at first trigger) if the scenario is malformed.
    pub fn new(scenario: ChaosScenario, hooks: Arc<ChaosHooks>) -> Result<Self, String> {
        scenario.validate()?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                scenario,
                hooks,
                state: RwLock::new(None),
                tick_handle: RwLock::new(None),
                callback: RwLock::new(None),
            }),
        })
    }

    /// Begin evaluating triggers for `run_id`. Idempotent: a second
    /// call while already running is a no-op (§4.6).
    pub fn start<F>(&self, run_id: RunId, on_chaos_event: F)
    where
        F: Fn(ChaosEvent) + Send + Sync + 'static,
    {
        {
            let mut state = self.inner.state.write();
            if state.is_some() {
                return;
            }
            *state = Some(ChaosState::new(self.inner.scenario.name.clone(), run_id));
        }
        *self.inner.callback.write() = Some(Arc::new(on_chaos_event));

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if inner.state.read().is_none() {
                    break;
                }
                inner.check_time_triggers().await;
            }
        });
        *self.inner.tick_handle.write() = Some(handle);
    }

    /// Stop evaluating triggers, cancel the tick task, and release any
    /// outstanding table locks immediately rather than waiting out
    /// their duration.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.tick_handle.write().take() {
            handle.abort();
        }
        *self.inner.state.write() = None;
        *self.inner.callback.write() = None;
        self.inner.hooks.release_all_locks();
    }

    /// Whether the scheduler is currently RUNNING.
    pub fn is_running(&self) -> bool {
        self.inner.state.read().is_some()
    }

    /// A snapshot of the scheduler's runtime state, for status
    /// reporting. `None` while IDLE/STOPPED.
    pub fn state(&self) -> Option<ChaosState> {
        self.inner.state.read().clone()
    }

    /// Feed one intercepted SQL event through the event-trigger and
    /// count-trigger evaluation (§4.6 steps 1-3). Spawns its own task
    /// so the caller (the proxy's hot path) never waits on a hook.
    pub fn on_sql_event(&self, event: &SqlEvent) {
        let inner = Arc::clone(&self.inner);
        let event = event.clone();
        tokio::spawn(async move {
            inner.handle_sql_event(event).await;
        });
    }
}

impl SchedulerInner {
    async fn handle_sql_event(&self, event: SqlEvent) {
        let event_type = event_type_of(&event);
        let sql_type = sql_type_key(event.sql_type);
        let counted_key = format!("{event_type}:{sql_type}");

        {
            let mut state = self.state.write();
            let Some(state) = state.as_mut() else { return };
            *state.event_counts.entry(counted_key).or_insert(0) += 1;
        }

        for (index, trigger) in self.scenario.triggers.iter().enumerate() {
            if !trigger.enabled {
                continue;
            }
            match trigger.trigger_type {
                TriggerType::Event => {
                    if self.event_trigger_matches(trigger, index, &event, event_type, sql_type) {
                        self.fire(trigger, index, &event.tables).await;
                    }
                }
                TriggerType::Count => {
                    if self.count_trigger_matches(trigger, index, sql_type) {
                        self.fire(trigger, index, &event.tables).await;
                    }
                }
                TriggerType::Time => {}
            }
        }
    }

    fn event_trigger_matches(
        &self,
        trigger: &ChaosTrigger,
        index: usize,
        event: &SqlEvent,
        event_type: &str,
        sql_type: &str,
    ) -> bool {
        let Some(condition) = &trigger.event_condition else { return false };

        if !event_type.to_lowercase().contains(&condition.event_type.to_lowercase()) {
            return false;
        }
        if let Some(parsed_type) = &condition.parsed_type {
            if !parsed_type.eq_ignore_ascii_case(sql_type) {
                return false;
            }
        }
        if let Some(pattern) = &condition.table_pattern {
            let pattern = pattern.to_lowercase();
            if !event.tables.iter().any(|t| t.to_lowercase().contains(&pattern)) {
                return false;
            }
        }
        if let Some(min_rows) = condition.min_rows {
            if event.rows_estimated.unwrap_or(0) < min_rows {
                return false;
            }
        }

        let key = trigger.key(index);
        let state = self.state.read();
        let Some(state) = state.as_ref() else { return false };
        let fire_count = state.trigger_fire_counts.get(&key).copied().unwrap_or(0);

        let occurrence_matches = match condition.occurrence {
            Occurrence::Named(OccurrenceKeyword::First) => fire_count == 0,
            Occurrence::Named(OccurrenceKeyword::Every) => true,
            Occurrence::Nth(n) => fire_count == n.saturating_sub(1),
        };
        if !occurrence_matches {
            return false;
        }
        if fire_count >= trigger.max_triggers {
            return false;
        }
        if trigger.cooldown_seconds > 0 {
            if let Some(last_fired) = state.trigger_last_fired.get(&key) {
                let elapsed = (chaostrace_foundation::now() - *last_fired).num_seconds().max(0) as u64;
                if elapsed < trigger.cooldown_seconds {
                    return false;
                }
            }
        }
        true
    }

    fn count_trigger_matches(&self, trigger: &ChaosTrigger, index: usize, sql_type: &str) -> bool {
        let Some(condition) = &trigger.count_condition else { return false };
        let key = trigger.key(index);
        let candidate_key = format!("{}:{sql_type}", condition.event_type);

        let mut state = self.state.write();
        let Some(state) = state.as_mut() else { return false };
        let fire_count = state.trigger_fire_counts.get(&key).copied().unwrap_or(0);
        let observed = state.event_counts.get(&candidate_key).copied().unwrap_or(0);

        if observed < condition.count || fire_count >= trigger.max_triggers {
            return false;
        }
        if condition.reset_after_trigger {
            state.event_counts.insert(candidate_key, 0);
        }
        true
    }

    async fn check_time_triggers(&self) {
        let (elapsed, run_id) = {
            let state = self.state.read();
            let Some(state) = state.as_ref() else { return };
            let elapsed = (chaostrace_foundation::now() - state.started_at).num_seconds().max(0) as u64;
            (elapsed, state.run_id)
        };

        for (index, trigger) in self.scenario.triggers.iter().enumerate() {
            if !trigger.enabled || trigger.trigger_type != TriggerType::Time {
                continue;
            }
            let Some(condition) = &trigger.time_condition else { continue };
            let key = trigger.key(index);

            let effective_time = {
                let mut state = self.state.write();
                let Some(state) = state.as_mut() else { return };
                if let Some(cached) = state.trigger_effective_time.get(&key) {
                    *cached
                } else {
                    let jitter = if condition.jitter_seconds > 0 {
                        rand::rng().random_range(0..=condition.jitter_seconds)
                    } else {
                        0
                    };
                    let effective = condition.elapsed_seconds + jitter;
                    state.trigger_effective_time.insert(key.clone(), effective);
                    effective
                }
            };

            let fire_count = {
                let state = self.state.read();
                state
                    .as_ref()
                    .and_then(|s| s.trigger_fire_counts.get(&key).copied())
                    .unwrap_or(0)
            };

            if elapsed >= effective_time && fire_count == 0 {
                let _ = run_id;
                self.fire(trigger, index, &[]).await;
            }
        }
    }

    async fn fire(&self, trigger: &ChaosTrigger, index: usize, tables: &[String]) {
        let key = trigger.key(index);
        let run_id = {
            let mut state = self.state.write();
            let Some(state) = state.as_mut() else { return };
            if state.total_chaos_events >= self.scenario.max_total_chaos_events {
                return;
            }
            *state.trigger_fire_counts.entry(key.clone()).or_insert(0) += 1;
            state.trigger_last_fired.insert(key.clone(), chaostrace_foundation::now());
            state.total_chaos_events += 1;
            state.run_id
        };

        let context = ActionContext { run_id: Some(run_id), tables: tables.to_vec() };
        match self.hooks.execute(&trigger.action, &context).await {
            Ok(result) => {
                if let Some(callback) = self.callback.read().clone() {
                    let chaos_event = ChaosEvent {
                        envelope: EventEnvelope::new(run_id),
                        chaos_type: format!("{:?}", trigger.action.action_type).to_lowercase(),
                        trigger_type: format!("{:?}", trigger.trigger_type).to_lowercase(),
                        trigger_condition: key,
                        target: result.target,
                        duration_seconds: result.duration_seconds,
                        parameters: trigger.action.parameters.clone(),
                    };
                    callback(chaos_event);
                }
            }
            Err(err) => {
                warn!(trigger = %key, error = %err, "chaos hook failed, continuing scenario");
            }
        }
    }
}

fn event_type_of(event: &SqlEvent) -> &'static str {
    use chaostrace_model::PolicyAction;
    match event.policy_action {
        PolicyAction::Allow => "sql_allowed",
        PolicyAction::Block => "sql_blocked",
        PolicyAction::AllowFlagged => "sql_flagged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_model::{ChaosAction, ChaosActionType, EventCondition, PolicyAction};

    fn sample_event(sql_type: SqlType, tables: Vec<String>) -> SqlEvent {
        SqlEvent {
            envelope: EventEnvelope::new(RunId::new()),
            statement: "SELECT 1".to_string(),
            statement_hash: "deadbeef".to_string(),
            sql_type,
            tables,
            has_where_clause: true,
            risk_level: chaostrace_model::RiskLevel::Low,
            risk_factors: vec![],
            rows_estimated: None,
            policy_action: PolicyAction::Allow,
            policy_rule_matched: None,
            violation_reason: None,
            latency_ms: 1.0,
            rows_affected: None,
            execution_error: None,
        }
    }

    fn sample_trigger(trigger_type: TriggerType) -> ChaosTrigger {
        ChaosTrigger {
            name: "t1".to_string(),
            enabled: true,
            trigger_type,
            event_condition: None,
            time_condition: None,
            count_condition: None,
            action: ChaosAction {
                action_type: ChaosActionType::AddLatency,
                table: None,
                column: None,
                duration_seconds: Some(1),
                delay_seconds: 0,
                latency_ms: Some(100),
                new_name: None,
                new_type: None,
                percentage: None,
                parameters: Default::default(),
            },
            max_triggers: 1,
            cooldown_seconds: 0,
        }
    }

    #[test]
    fn sample_trigger_is_well_formed() {
        let trigger = sample_trigger(TriggerType::Event);
        assert!(trigger.validate().is_err(), "event trigger with no event_condition should fail validation");
    }

    #[test]
    fn event_type_of_maps_policy_action() {
        let mut event = sample_event(SqlType::Select, vec!["users".to_string()]);
        event.policy_action = PolicyAction::Block;
        assert_eq!(event_type_of(&event), "sql_blocked");
    }

    #[test]
    fn sql_type_key_is_lowercase() {
        assert_eq!(sql_type_key(SqlType::Delete), "delete");
        assert_eq!(sql_type_key(SqlType::Select), "select");
    }

    #[test]
    fn unused_import_reference() {
        let _ = EventCondition {
            event_type: "sql".to_string(),
            parsed_type: None,
            table_pattern: None,
            occurrence: Occurrence::default(),
            min_rows: None,
        };
    }
}
