//! Risk assessment output type and the risk-level ordinal.

use serde::{Deserialize, Serialize};

/// Risk level assigned to a parsed statement. Variants are declared in
/// increasing severity so the derived [`Ord`] *is* the severity
/// ordinal — there is no separate lookup table to drift out of sync
/// with it, which is the failure mode this replaces (comparing a
/// string-backed severity lexicographically gives no ordering
/// guarantee at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Routine reads and well-scoped writes.
    Low,
    /// Writes without full row-scope confidence, or elevated
    /// complexity.
    Medium,
    /// Schema/permission mutations, or unscoped single-row-risk
    /// writes.
    High,
    /// Destructive, unscoped, or massive-row-estimate operations.
    Critical,
}

impl RiskLevel {
    /// Saturating successor: one level up, pinned at `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }

    /// Raise `self` to at least `floor`, never lowering it.
    pub fn at_least(self, floor: RiskLevel) -> Self {
        self.max(floor)
    }
}

/// Output of the risk scorer: a deterministic function of one parsed
/// statement and the scorer's static configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// The assigned risk level.
    pub risk_level: RiskLevel,
    /// Ordered list of human-readable factors that contributed to the
    /// level, in the order they were evaluated.
    pub risk_factors: Vec<String>,
    /// Estimated rows affected, when the scorer's heuristic applies.
    pub rows_estimated: Option<u64>,
    /// Confidence in `0.0..=1.0`; currently fixed per sql_type rather
    /// than computed, matching the reference scorer.
    pub confidence: f64,
    /// Human-readable advisory sentence. Informational only; never
    /// read by the policy engine.
    pub recommendation: String,
}
