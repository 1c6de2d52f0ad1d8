//! The declarative policy document and the result of evaluating a
//! statement against one.

use serde::{Deserialize, Deserializer, Serialize};

use crate::statement::SqlType;

/// Severity assigned by a policy rule. Declared low-to-high so the
/// derived [`Ord`] is the severity ordinal used everywhere a
/// comparison like "is this at least ERROR" is needed (see
/// [`crate::risk::RiskLevel`] for the identical rationale).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicySeverity {
    /// Recorded, does not affect the allow/flag decision.
    Info,
    /// Allowed, but flagged for elevated attention in reports.
    Warning,
    /// Blocks the statement.
    Error,
    /// Blocks the statement; reserved for honeypot trips and the most
    /// dangerous forbidden patterns.
    Critical,
}

/// One `forbidden_sql` rule: a regular expression, the severity it
/// carries when it matches, and the message to surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForbiddenSqlRule {
    /// The regular expression pattern (not yet compiled).
    pub pattern: String,
    /// Severity this rule contributes when it matches.
    #[serde(default = "default_forbidden_severity")]
    pub severity: PolicySeverity,
    /// Human-readable message shown when the rule matches.
    #[serde(default)]
    pub message: Option<String>,
    /// Whether the match is case-sensitive. Defaults to `false`.
    #[serde(default)]
    pub case_sensitive: bool,
}

fn default_forbidden_severity() -> PolicySeverity {
    PolicySeverity::Error
}

/// `forbidden_sql` accepts three YAML shapes: a bare string (sugar for
/// `{pattern: <string>, severity: ERROR}`), a single pattern object, or
/// an object with a `patterns:` key mapping to a list of either.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ForbiddenSqlShape {
    Bare(String),
    Rule(ForbiddenSqlRule),
    Wrapped { patterns: Vec<ForbiddenSqlShapeInner> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ForbiddenSqlShapeInner {
    Bare(String),
    Rule(ForbiddenSqlRule),
}

impl From<ForbiddenSqlShapeInner> for ForbiddenSqlRule {
    fn from(value: ForbiddenSqlShapeInner) -> Self {
        match value {
            ForbiddenSqlShapeInner::Bare(pattern) => ForbiddenSqlRule {
                pattern,
                severity: PolicySeverity::Error,
                message: None,
                case_sensitive: false,
            },
            ForbiddenSqlShapeInner::Rule(rule) => rule,
        }
    }
}

/// Deserialize the flexible `forbidden_sql` shape into a flat list of
/// rules, per §6's policy YAML schema.
pub fn deserialize_forbidden_sql<'de, D>(
    deserializer: D,
) -> Result<Vec<ForbiddenSqlRule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<ForbiddenSqlShape> = Vec::deserialize(deserializer)?;
    let mut rules = Vec::new();
    for shape in raw {
        match shape {
            ForbiddenSqlShape::Bare(pattern) => rules.push(ForbiddenSqlRule {
                pattern,
                severity: PolicySeverity::Error,
                message: None,
                case_sensitive: false,
            }),
            ForbiddenSqlShape::Rule(rule) => rules.push(rule),
            ForbiddenSqlShape::Wrapped { patterns } => {
                rules.extend(patterns.into_iter().map(ForbiddenSqlRule::from));
            }
        }
    }
    Ok(rules)
}

/// Restriction scoped to tables matching `table_pattern` (a literal
/// name or a `*`-wildcard glob, matched case-insensitively).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRestriction {
    /// Table name or glob pattern this restriction applies to.
    pub table_pattern: String,
    /// Statement types this restriction applies to. Empty means all.
    #[serde(default)]
    pub operations: Vec<SqlType>,
    /// Require a `WHERE` clause for DELETE/UPDATE against this table.
    #[serde(default)]
    pub require_where: bool,
    /// Maximum estimated rows permitted.
    #[serde(default)]
    pub max_rows: Option<u64>,
    /// If set, only these columns may be referenced.
    #[serde(default)]
    pub allowed_columns: Option<Vec<String>>,
    /// These columns may never be referenced.
    #[serde(default)]
    pub forbidden_columns: Vec<String>,
}

/// A global row-count limit applying to every statement of a given
/// type, independent of which table it touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowLimit {
    /// Statement type this limit applies to.
    pub operation: SqlType,
    /// Row threshold.
    pub max_rows: u64,
    /// Severity contributed when `max_rows` is exceeded.
    pub action_severity: PolicySeverity,
}

/// Off-limits resources: any reference is a severe violation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HoneypotConfig {
    /// Table names that must never be referenced.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Column names that must never be referenced.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Filesystem paths that must never be referenced (carried through
    /// for parity with the reference schema; the SQL-only core never
    /// inspects this field itself).
    #[serde(default)]
    pub files: Vec<String>,
    /// Severity assigned when a honeypot is tripped.
    #[serde(default = "default_honeypot_severity")]
    pub severity: PolicySeverity,
}

fn default_honeypot_severity() -> PolicySeverity {
    PolicySeverity::Critical
}

/// A complete, declaratively-loaded policy document (§6 YAML schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    /// Policy name.
    pub name: String,
    /// Policy document version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Forbidden-pattern rules, normalized from any of the three YAML
    /// shapes §6 allows.
    #[serde(default, deserialize_with = "deserialize_forbidden_sql")]
    pub forbidden_sql: Vec<ForbiddenSqlRule>,
    /// Per-table restrictions.
    #[serde(default)]
    pub table_restrictions: Vec<TableRestriction>,
    /// Global per-operation row limits.
    #[serde(default)]
    pub row_limits: Vec<RowLimit>,
    /// Honeypot configuration.
    #[serde(default)]
    pub honeypots: HoneypotConfig,
    /// Whether referencing a table absent from every restriction is
    /// itself a violation. Carried through for parity with the reference
    /// schema; the evaluator has no notion of a table's presence in a
    /// schema independent of `table_restrictions`, so it is not read by
    /// `evaluate`.
    #[serde(default)]
    pub fail_on_unknown_table: bool,
    /// Whether every statement must run inside an explicit
    /// transaction. Carried through for parity with the reference
    /// schema; enforcing it requires connection-level transaction
    /// state the statement-level evaluator does not have, so it is
    /// not read by `evaluate`.
    #[serde(default)]
    pub require_transaction: bool,
    /// Maximum statement length in bytes.
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_max_query_length() -> usize {
    10_000
}

/// The action a policy decision maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyAction {
    /// Forward the statement.
    Allow,
    /// Block the statement; synthesize a protocol error.
    Block,
    /// Forward the statement, but flag it in reports.
    AllowFlagged,
}

/// Result of evaluating one statement against a loaded policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    /// Whether the statement may be forwarded.
    pub allowed: bool,
    /// Whether the statement is flagged for elevated attention.
    pub flagged: bool,
    /// Highest severity observed during evaluation.
    pub severity: PolicySeverity,
    /// Identifiers of every rule that matched.
    pub matched_rules: Vec<String>,
    /// Reasons severe enough to block (ERROR/CRITICAL findings).
    pub violation_reasons: Vec<String>,
    /// Reasons that only warrant a warning.
    pub warnings: Vec<String>,
}

impl PolicyEvaluation {
    /// Map this evaluation to the [`PolicyAction`] the proxy acts on.
    pub fn action(&self) -> PolicyAction {
        if !self.allowed {
            PolicyAction::Block
        } else if self.flagged {
            PolicyAction::AllowFlagged
        } else {
            PolicyAction::Allow
        }
    }
}
