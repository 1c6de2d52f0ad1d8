//! Shared data model for the chaostrace workspace: run lifecycle
//! records, the parsed-statement fingerprint, risk assessment, policy
//! documents and evaluation results, the chaos scenario/state model,
//! and the sealed event envelope that ties all of the above together
//! in the durable event log.

pub mod chaos;
pub mod events;
pub mod policy;
pub mod risk;
pub mod run;
pub mod statement;

pub use chaos::{
    ChaosAction, ChaosActionType, ChaosScenario, ChaosState, ChaosTrigger, CountCondition,
    EventCondition, Occurrence, OccurrenceKeyword, TimeCondition, TriggerType,
};
pub use events::{AgentEvent, ChaosEvent, Event, EventEnvelope, RunLifecycleEvent, SqlEvent};
pub use policy::{
    ForbiddenSqlRule, HoneypotConfig, PolicyAction, PolicyDefinition, PolicyEvaluation,
    PolicySeverity, RowLimit, TableRestriction,
};
pub use risk::{RiskAssessment, RiskLevel};
pub use run::{
    AgentType, RunId, RunListResponse, RunRequest, RunResponse, RunState, RunStatus, RunSummary,
    SandboxHandles, Verdict,
};
pub use statement::{ParsedStatement, SqlType, StructuralFlags};
