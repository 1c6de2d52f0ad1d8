//! Run lifecycle types: the declarative request, the mutable state
//! record the orchestrator owns, and the read-only views handed back
//! to callers.

use std::collections::HashMap;

use chaostrace_foundation::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit identifier minted when a run is created. Keys every
/// event belonging to that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Mint a fresh, random run id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of agent binary is under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// A plain Python entry point.
    Python,
    /// An OpenAI-function-calling agent.
    Openai,
    /// A LangChain-based agent.
    Langchain,
    /// Any other invocation the caller describes themselves.
    Custom,
}

/// Lifecycle status of a run. Transitions are monotonic: the
/// orchestrator never moves a run backwards through this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, not yet initializing.
    Pending,
    /// Sandbox topology is being created.
    Initializing,
    /// Agent container is running.
    Running,
    /// Agent exited 0.
    Completed,
    /// Agent exited non-zero, or the sandbox failed to come up.
    Failed,
    /// Timed out or explicitly terminated.
    Terminated,
    /// Tearing down containers and network.
    Cleanup,
}

/// Final pass/fail label assigned once a run reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No violations, nothing blocked.
    Pass,
    /// Policy violations were recorded.
    Fail,
    /// No violations, but at least one statement was blocked.
    Warn,
    /// The run did not reach a conclusive terminal state (timed out).
    Incomplete,
}

/// The declarative intent behind a run. Immutable once accepted by the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// What kind of agent is being invoked.
    pub agent_type: AgentType,
    /// Path or identifier locating the agent's entry point.
    pub agent_entry: String,
    /// Name of the seed-data/success-criteria scenario to load.
    pub scenario: String,
    /// Name of the policy profile to enforce. Defaults to "strict".
    #[serde(default = "default_policy_profile")]
    pub policy_profile: String,
    /// Optional name of a chaos scenario to run alongside the agent.
    #[serde(default)]
    pub chaos_profile: Option<String>,
    /// Wall-clock budget for the run, in seconds. Bounded [10, 3600].
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    /// Extra environment variables injected into the agent container.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Free-form metadata carried alongside the run, not interpreted
    /// by the core.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_policy_profile() -> String {
    "strict".to_string()
}

fn default_timeout_seconds() -> u32 {
    300
}

/// Pattern every `scenario`/`policy_profile`/`chaos_profile` name must
/// match: lowercase ASCII letters, digits, and underscores.
pub fn is_valid_profile_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl RunRequest {
    /// Validate the structural constraints §6 places on a run request:
    /// name patterns and the timeout bound. Does not check that the
    /// named scenario/policy/chaos profile actually exists — that is
    /// the orchestrator's concern, not the request's.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_profile_name(&self.scenario) {
            return Err(format!("invalid scenario name: {}", self.scenario));
        }
        if !is_valid_profile_name(&self.policy_profile) {
            return Err(format!("invalid policy_profile name: {}", self.policy_profile));
        }
        if let Some(chaos) = &self.chaos_profile {
            if !is_valid_profile_name(chaos) {
                return Err(format!("invalid chaos_profile name: {chaos}"));
            }
        }
        if !(10..=3600).contains(&self.timeout_seconds) {
            return Err(format!(
                "timeout_seconds must be in [10, 3600], got {}",
                self.timeout_seconds
            ));
        }
        Ok(())
    }
}

/// Immediate response to `create_run`: the run exists and is PENDING.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    /// The newly minted run id.
    pub run_id: RunId,
    /// Always `RunStatus::Pending` at creation time.
    pub status: RunStatus,
}

/// Container and network handles the orchestrator holds for the
/// duration of a run's sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxHandles {
    /// Docker network id.
    pub network_id: Option<String>,
    /// Database container id.
    pub database_container_id: Option<String>,
    /// Proxy container id.
    pub proxy_container_id: Option<String>,
    /// Agent container id.
    pub agent_container_id: Option<String>,
}

/// Mutable lifecycle record for one run. Created by the orchestrator;
/// mutated only by the orchestrator; never destroyed in-memory for the
/// lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// This run's id.
    pub id: RunId,
    /// The request that created this run.
    pub request: RunRequest,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Final verdict, set once the run reaches a terminal state.
    pub verdict: Option<Verdict>,
    /// When the run was created.
    pub created_at: Timestamp,
    /// When the sandbox finished initializing and the agent started.
    pub started_at: Option<Timestamp>,
    /// When the run reached a terminal state.
    pub ended_at: Option<Timestamp>,
    /// Sandbox container/network handles.
    pub handles: SandboxHandles,
    /// Total SQL statements observed so far.
    pub total_statements: u64,
    /// Statements blocked by policy so far.
    pub blocked_statements: u64,
    /// Chaos actions fired so far.
    pub chaos_events_fired: u64,
    /// Human-readable policy violation reasons accumulated this run.
    pub violation_reasons: Vec<String>,
    /// Set when a run transitions to FAILED or TERMINATED, naming the
    /// phase or cause.
    pub error_message: Option<String>,
}

impl RunState {
    /// Construct a fresh, PENDING run state from an accepted request.
    pub fn new(id: RunId, request: RunRequest) -> Self {
        Self {
            id,
            request,
            status: RunStatus::Pending,
            verdict: None,
            created_at: chaostrace_foundation::now(),
            started_at: None,
            ended_at: None,
            handles: SandboxHandles::default(),
            total_statements: 0,
            blocked_statements: 0,
            chaos_events_fired: 0,
            violation_reasons: Vec::new(),
            error_message: None,
        }
    }

    /// Whether this run has reached one of the three terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Terminated
        )
    }
}

/// A condensed view of a run, suitable for listing many runs at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// The run's id.
    pub id: RunId,
    /// Scenario name the run was invoked with.
    pub scenario: String,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Final verdict, if terminal.
    pub verdict: Option<Verdict>,
    /// Creation timestamp, used to sort listings newest-first.
    pub created_at: Timestamp,
}

impl From<&RunState> for RunSummary {
    fn from(state: &RunState) -> Self {
        Self {
            id: state.id,
            scenario: state.request.scenario.clone(),
            status: state.status,
            verdict: state.verdict,
            created_at: state.created_at,
        }
    }
}

/// A page of run summaries, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListResponse {
    /// The runs on this page.
    pub runs: Vec<RunSummary>,
    /// Total number of runs known to the orchestrator.
    pub total: usize,
    /// The page number returned (1-based).
    pub page: usize,
    /// The page size used.
    pub page_size: usize,
}
