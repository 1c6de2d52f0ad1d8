//! The sealed event envelope durably recorded by the event store: one
//! variant per observable occurrence during a run (§3's `Event`).
//!
//! §10.1 adds a fourth variant, `Agent`, alongside the distilled
//! spec's `SQL`/`Chaos`/`RunLifecycle` trio — the reference model
//! defines `AgentEvent` but the distilled spec's §3 data model omits
//! it by oversight; every other subsystem (report generator, event
//! store filter prefixes) already expects an `"agent"` event class.

use std::collections::HashMap;

use chaostrace_foundation::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::PolicyAction;
use crate::risk::RiskLevel;
use crate::run::{RunId, Verdict};
use crate::statement::SqlType;

/// Fields shared by every event variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique event identifier.
    pub event_id: Uuid,
    /// The run this event belongs to.
    pub run_id: RunId,
    /// When the event occurred.
    pub timestamp: Timestamp,
    /// Additional event-specific metadata not otherwise modeled.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Mint a fresh envelope for `run_id`, stamped with the current
    /// time.
    pub fn new(run_id: RunId) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id,
            timestamp: chaostrace_foundation::now(),
            metadata: HashMap::new(),
        }
    }
}

/// An intercepted SQL statement and the decision made about it — the
/// primary event type for analyzing an agent's database behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlEvent {
    /// Fields shared with every other event variant.
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    /// The raw SQL statement text.
    pub statement: String,
    /// First 16 hex chars of the normalized statement's SHA-256.
    pub statement_hash: String,
    /// Classified statement type.
    pub sql_type: SqlType,
    /// Tables referenced by the statement.
    pub tables: Vec<String>,
    /// Whether the statement has a `WHERE` clause.
    pub has_where_clause: bool,
    /// Assessed risk level.
    pub risk_level: RiskLevel,
    /// Factors contributing to the risk assessment.
    pub risk_factors: Vec<String>,
    /// Estimated rows affected, if the scorer could estimate.
    pub rows_estimated: Option<u64>,
    /// Action the policy engine took.
    pub policy_action: PolicyAction,
    /// Name of the policy rule that matched, if any.
    pub policy_rule_matched: Option<String>,
    /// Reason for blocking, if blocked.
    pub violation_reason: Option<String>,
    /// Time from receipt to decision, in milliseconds.
    pub latency_ms: f64,
    /// Actual rows affected, once the server responds (not populated
    /// by the proxy's synchronous decision path).
    #[serde(default)]
    pub rows_affected: Option<u64>,
    /// Execution error reported by the server, if any.
    #[serde(default)]
    pub execution_error: Option<String>,
}

/// A chaos action fired by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosEvent {
    /// Fields shared with every other event variant.
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    /// Which chaos action type fired (e.g. `"lock_table"`).
    pub chaos_type: String,
    /// What kind of trigger fired it (`"event"`, `"time"`, `"count"`).
    pub trigger_type: String,
    /// Human-readable description of the condition that was met.
    pub trigger_condition: String,
    /// Target of the chaos action, e.g. a table name.
    pub target: Option<String>,
    /// Duration of the chaos effect, in seconds.
    pub duration_seconds: Option<u64>,
    /// Additional action-specific parameters.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// A run lifecycle status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLifecycleEvent {
    /// Fields shared with every other event variant.
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    /// Status the run transitioned from, absent for the initial
    /// PENDING->INITIALIZING step's predecessor.
    pub previous_status: Option<String>,
    /// Status the run transitioned to.
    pub new_status: String,
    /// Human-readable description of the transition.
    pub message: String,
    /// Final verdict, populated only on the terminal transition.
    pub verdict: Option<Verdict>,
}

/// An action or error surfaced by the agent under test itself (§10.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Fields shared with every other event variant.
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    /// Description of the agent action.
    pub action: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Error message, if the action failed.
    pub error_message: Option<String>,
    /// Duration of the action, in milliseconds.
    pub duration_ms: Option<f64>,
}

/// The sealed event envelope persisted by the event store. Replaces
/// the reference model's flat `EventType` string enum plus one
/// `BaseEvent` subclass per family: the `event_type` string used for
/// filtering and chaos-trigger matching is derived from the variant
/// (and, for `Sql`, the policy action) rather than stored
/// independently, so the two can never drift apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_class", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// §3 `SQLEvent`.
    Sql(SqlEvent),
    /// §3 `ChaosEvent`.
    Chaos(ChaosEvent),
    /// §3 `RunLifecycleEvent`.
    RunLifecycle(RunLifecycleEvent),
    /// §10.1 `AgentEvent`.
    Agent(AgentEvent),
}

impl Event {
    /// The envelope fields common to every variant.
    pub fn envelope(&self) -> &EventEnvelope {
        match self {
            Event::Sql(e) => &e.envelope,
            Event::Chaos(e) => &e.envelope,
            Event::RunLifecycle(e) => &e.envelope,
            Event::Agent(e) => &e.envelope,
        }
    }

    /// The run this event belongs to.
    pub fn run_id(&self) -> RunId {
        self.envelope().run_id
    }

    /// The timestamp this event occurred at.
    pub fn timestamp(&self) -> Timestamp {
        self.envelope().timestamp
    }

    /// The flat `event_type` string used for filtering and chaos
    /// trigger matching (§4.4 filter semantics, §4.6 event triggers):
    /// `"sql_allowed"` / `"sql_blocked"` / `"sql_flagged"` for SQL
    /// events (derived from the policy action), `"chaos_triggered"`
    /// for chaos events, `"run_<status>"` for lifecycle events, and
    /// `"agent_action"` / `"agent_error"` for agent events.
    pub fn event_type(&self) -> String {
        match self {
            Event::Sql(e) => match e.policy_action {
                PolicyAction::Allow => "sql_allowed".to_string(),
                PolicyAction::Block => "sql_blocked".to_string(),
                PolicyAction::AllowFlagged => "sql_flagged".to_string(),
            },
            Event::Chaos(_) => "chaos_triggered".to_string(),
            Event::RunLifecycle(e) => format!("run_{}", e.new_status),
            Event::Agent(e) => {
                if e.success {
                    "agent_action".to_string()
                } else {
                    "agent_error".to_string()
                }
            }
        }
    }

    /// The coarse prefix a `type_filter` like `"sql"` or `"chaos"`
    /// matches against (§4.4).
    pub fn event_class(&self) -> &'static str {
        match self {
            Event::Sql(_) => "sql",
            Event::Chaos(_) => "chaos",
            Event::RunLifecycle(_) => "run",
            Event::Agent(_) => "agent",
        }
    }
}
