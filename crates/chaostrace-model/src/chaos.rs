//! Chaos scenario definition, loaded from YAML, and the runtime state
//! the scheduler mutates while a scenario is active.

use std::collections::HashMap;

use chaostrace_foundation::Timestamp;
use serde::{Deserialize, Serialize};

use crate::run::RunId;

/// What kind of condition triggers a chaos action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fires in response to a matching intercepted event.
    Event,
    /// Fires once elapsed run time passes a threshold.
    Time,
    /// Fires once a matching event has been observed N times.
    Count,
}

/// The concrete side-effectful operations a chaos hook can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosActionType {
    /// Hold an exclusive lock on a table.
    LockTable,
    /// Add a process-wide latency override.
    AddLatency,
    /// Instruct the proxy to synthesize a connection-closed error.
    SimulateTimeout,
    /// Rotate the agent's database credentials.
    RevokeCredentials,
    /// Rename a column.
    RenameColumn,
    /// Change a column's type.
    ChangeColumnType,
    /// Drop a named index.
    DropIndex,
    /// Advisory: simulate disk pressure.
    DiskFull,
    /// Advisory: simulate memory pressure.
    MemoryPressure,
    /// Advisory: throttle CPU.
    CpuThrottle,
    /// Advisory: simulate a network partition.
    NetworkPartition,
    /// Advisory: introduce packet loss.
    PacketLoss,
}

/// When an event-triggered chaos trigger is eligible to fire, relative
/// to how many times it has already fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Occurrence {
    /// Fire only the first time the condition matches.
    Named(OccurrenceKeyword),
    /// Fire when the condition has matched exactly this many times
    /// (1-based, so `3` fires on the third match).
    Nth(u32),
}

/// The two non-numeric occurrence keywords the distilled spec names.
/// The reference model also accepts a `"last"` literal that its own
/// scheduler never special-cases (it behaves identically to
/// `"every"`); this workspace does not carry that dead value forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceKeyword {
    /// Fire only on the first match.
    First,
    /// Fire on every match, subject to `max_triggers`/`cooldown`.
    Every,
}

impl Default for Occurrence {
    fn default() -> Self {
        Occurrence::Named(OccurrenceKeyword::First)
    }
}

/// Condition matched against incoming intercepted events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCondition {
    /// Substring (case-insensitive) the event's type must contain.
    pub event_type: String,
    /// If set, the parsed SQL type the event must carry (exact,
    /// case-insensitive).
    #[serde(default)]
    pub parsed_type: Option<String>,
    /// If set, a substring (case-insensitive) one of the event's
    /// tables must contain.
    #[serde(default)]
    pub table_pattern: Option<String>,
    /// Which occurrence of a match should fire.
    #[serde(default)]
    pub occurrence: Occurrence,
    /// Minimum estimated rows for the trigger to consider the event.
    #[serde(default)]
    pub min_rows: Option<u64>,
}

/// Condition matched against elapsed run time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeCondition {
    /// Seconds since the run (and the scheduler) started.
    pub elapsed_seconds: u64,
    /// Random jitter added once, the first time this trigger is
    /// considered, and then reused (§10.8).
    #[serde(default)]
    pub jitter_seconds: u64,
}

/// Condition matched against a running count of observed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountCondition {
    /// The event type being counted.
    pub event_type: String,
    /// Threshold count.
    pub count: u64,
    /// Whether to zero the counter once this condition fires.
    #[serde(default)]
    pub reset_after_trigger: bool,
}

/// A chaos action to execute when its trigger fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosAction {
    /// Which kind of chaos to inject.
    #[serde(rename = "type")]
    pub action_type: ChaosActionType,
    /// Target table, supporting the `{event.tables[0]}` template.
    #[serde(default)]
    pub table: Option<String>,
    /// Target column.
    #[serde(default)]
    pub column: Option<String>,
    /// Duration of the chaos effect, in seconds.
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    /// Delay before starting the chaos, in seconds.
    #[serde(default)]
    pub delay_seconds: u64,
    /// Latency to inject, for `add_latency`.
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// New name, for rename operations.
    #[serde(default)]
    pub new_name: Option<String>,
    /// New type, for type-change operations.
    #[serde(default)]
    pub new_type: Option<String>,
    /// Percentage for probabilistic/advisory chaos (0-100).
    #[serde(default)]
    pub percentage: Option<u8>,
    /// Additional type-specific parameters not otherwise named above
    /// (e.g. an index name for `drop_index`).
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// A (condition, action) pair evaluated by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosTrigger {
    /// Optional name, used as the key for fire-count/last-fired
    /// tracking. Triggers without a name are still tracked, keyed by
    /// their position in the scenario's trigger list.
    #[serde(default)]
    pub name: String,
    /// Whether this trigger is active.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Which kind of condition this trigger evaluates.
    pub trigger_type: TriggerType,
    /// Condition for event-based triggers.
    #[serde(default)]
    pub event_condition: Option<EventCondition>,
    /// Condition for time-based triggers.
    #[serde(default)]
    pub time_condition: Option<TimeCondition>,
    /// Condition for count-based triggers.
    #[serde(default)]
    pub count_condition: Option<CountCondition>,
    /// The action to execute when the condition is met.
    pub action: ChaosAction,
    /// Maximum number of times this trigger may fire.
    #[serde(default = "default_max_triggers")]
    pub max_triggers: u32,
    /// Minimum time between fires, in seconds.
    #[serde(default)]
    pub cooldown_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_triggers() -> u32 {
    1
}

impl ChaosTrigger {
    /// Key used to track this trigger's fire count and last-fired
    /// time: its name if given, else its position in the scenario.
    pub fn key(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("trigger_{index}")
        } else {
            self.name.clone()
        }
    }

    /// Reject malformed triggers at load time: exactly the condition
    /// field matching `trigger_type` must be present, the others
    /// absent.
    pub fn validate(&self) -> Result<(), String> {
        match self.trigger_type {
            TriggerType::Event if self.event_condition.is_none() => {
                Err("event trigger requires event_condition".to_string())
            }
            TriggerType::Time if self.time_condition.is_none() => {
                Err("time trigger requires time_condition".to_string())
            }
            TriggerType::Count if self.count_condition.is_none() => {
                Err("count trigger requires count_condition".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// A complete chaos scenario loaded from YAML (§6 schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosScenario {
    /// Unique scenario name.
    pub name: String,
    /// Scenario document version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// The triggers this scenario evaluates.
    #[serde(default)]
    pub triggers: Vec<ChaosTrigger>,
    /// Whether this scenario is active. Carried through for parity with
    /// the reference schema; a disabled scenario is simply not passed
    /// to `ChaosScheduler::new` rather than loaded and then gated on
    /// this flag at `start`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ceiling on total chaos events this scenario may fire across a
    /// run, independent of any one trigger's `max_triggers`.
    #[serde(default = "default_max_total_chaos_events")]
    pub max_total_chaos_events: u32,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_max_total_chaos_events() -> u32 {
    100
}

impl ChaosScenario {
    /// Validate every trigger in this scenario, per §3's "validator
    /// must reject malformed scenarios at load time" invariant.
    pub fn validate(&self) -> Result<(), String> {
        for (index, trigger) in self.triggers.iter().enumerate() {
            trigger
                .validate()
                .map_err(|e| format!("trigger {} ({}): {e}", index, trigger.key(index)))?;
        }
        Ok(())
    }
}

/// Runtime mirror of one scenario's execution against one run.
/// Constructed at `scheduler.start()`; discarded at `stop()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosState {
    /// Name of the active scenario.
    pub scenario_name: String,
    /// The run this state belongs to.
    pub run_id: RunId,
    /// When the scheduler started.
    pub started_at: Timestamp,
    /// Fire counts, keyed by trigger key.
    pub trigger_fire_counts: HashMap<String, u32>,
    /// Last-fired timestamps, keyed by trigger key.
    pub trigger_last_fired: HashMap<String, Timestamp>,
    /// Cached effective fire time for time-based triggers, keyed by
    /// trigger key, resolved once per §10.8.
    pub trigger_effective_time: HashMap<String, u64>,
    /// Observed event counts, keyed by `"event_type:sql_type"`.
    pub event_counts: HashMap<String, u64>,
    /// Total chaos events fired so far.
    pub total_chaos_events: u32,
}

impl ChaosState {
    /// Construct a fresh state for a scenario beginning to run against
    /// `run_id`.
    pub fn new(scenario_name: String, run_id: RunId) -> Self {
        Self {
            scenario_name,
            run_id,
            started_at: chaostrace_foundation::now(),
            trigger_fire_counts: HashMap::new(),
            trigger_last_fired: HashMap::new(),
            trigger_effective_time: HashMap::new(),
            event_counts: HashMap::new(),
            total_chaos_events: 0,
        }
    }
}
