//! §4.3 Policy Engine: evaluates one already-parsed statement against
//! a loaded [`PolicyDefinition`]. The engine never re-parses — the
//! caller (the proxy connection) has already run the statement
//! through the analyzer.

use std::path::Path;

use chaostrace_model::{
    ParsedStatement, PolicyDefinition, PolicyEvaluation, PolicySeverity, SqlType,
};
use regex::Regex;
use thiserror::Error;

/// Errors loading or compiling a policy document.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// The policy file could not be read.
    #[error("io error reading policy: {0}")]
    Io(#[from] std::io::Error),
    /// The policy YAML did not parse into a [`PolicyDefinition`].
    #[error("invalid policy yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// A `forbidden_sql` pattern was not a valid regex.
    #[error("invalid regex pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying compile error.
        #[source]
        source: regex::Error,
    },
}

/// One `forbidden_sql` rule with its pattern pre-compiled at load
/// time (§9 "runtime regex compilation").
struct CompiledForbiddenRule {
    regex: Regex,
    pattern: String,
    severity: PolicySeverity,
    message: Option<String>,
}

/// Evaluates statements against one loaded policy. Regex patterns are
/// compiled once here and reused across every `evaluate` call; rebuild
/// a new engine (via [`PolicyEngine::load`]/[`PolicyEngine::from_definition`])
/// to pick up a changed policy document.
pub struct PolicyEngine {
    policy: PolicyDefinition,
    compiled_patterns: Vec<CompiledForbiddenRule>,
}

impl PolicyEngine {
    /// Load and compile a policy from a YAML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        let policy: PolicyDefinition = serde_yaml::from_str(&text)?;
        Self::from_definition(policy)
    }

    /// Compile a policy engine from an already-parsed
    /// [`PolicyDefinition`].
    pub fn from_definition(policy: PolicyDefinition) -> Result<Self, PolicyError> {
        let mut compiled_patterns = Vec::with_capacity(policy.forbidden_sql.len());
        for rule in &policy.forbidden_sql {
            let regex = if rule.case_sensitive {
                Regex::new(&rule.pattern)
            } else {
                Regex::new(&format!("(?i){}", rule.pattern))
            }
            .map_err(|source| PolicyError::InvalidPattern {
                pattern: rule.pattern.clone(),
                source,
            })?;
            compiled_patterns.push(CompiledForbiddenRule {
                regex,
                pattern: rule.pattern.clone(),
                severity: rule.severity,
                message: rule.message.clone(),
            });
        }
        Ok(Self {
            policy,
            compiled_patterns,
        })
    }

    /// The loaded policy's name.
    pub fn name(&self) -> &str {
        &self.policy.name
    }

    /// Evaluate one already-parsed statement against this policy
    /// (§4.3's evaluation order).
    pub fn evaluate(
        &self,
        sql: &str,
        parsed: &ParsedStatement,
        estimated_rows: Option<u64>,
    ) -> PolicyEvaluation {
        let mut severity = PolicySeverity::Info;
        let mut matched_rules = Vec::new();
        let mut violation_reasons = Vec::new();
        let mut warnings = Vec::new();

        // Step 1: length guard. Conclusive: short-circuits everything
        // else, matching the reference's early return.
        if sql.len() > self.policy.max_query_length {
            return PolicyEvaluation {
                allowed: false,
                flagged: false,
                severity: PolicySeverity::Error,
                matched_rules,
                violation_reasons: vec![format!(
                    "Query exceeds maximum length ({} > {})",
                    sql.len(),
                    self.policy.max_query_length
                )],
                warnings,
            };
        }

        // Step 2: forbidden patterns.
        for rule in &self.compiled_patterns {
            if rule.regex.is_match(sql) {
                matched_rules.push(format!("forbidden_pattern:{}", rule.pattern));
                if rule.severity >= severity {
                    severity = rule.severity;
                }
                let message = rule
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Matched forbidden pattern: {}", rule.pattern));
                if rule.severity >= PolicySeverity::Error {
                    violation_reasons.push(message);
                } else {
                    warnings.push(message);
                }
            }
        }

        // Step 3: honeypots.
        for table in &parsed.tables {
            if self
                .policy
                .honeypots
                .tables
                .iter()
                .any(|t| t.eq_ignore_ascii_case(table))
            {
                severity = severity.max(self.policy.honeypots.severity);
                violation_reasons.push(format!("Access to honeypot table: {table}"));
                matched_rules.push(format!("honeypot_table:{table}"));
            }
        }
        for column in &parsed.columns {
            if self
                .policy
                .honeypots
                .columns
                .iter()
                .any(|c| c.eq_ignore_ascii_case(column))
            {
                severity = severity.max(self.policy.honeypots.severity);
                violation_reasons.push(format!("Access to honeypot column: {column}"));
                matched_rules.push(format!("honeypot_column:{column}"));
            }
        }

        // Step 4: per-table restrictions.
        for table in &parsed.tables {
            for restriction in &self.policy.table_restrictions {
                if !table_matches(table, &restriction.table_pattern) {
                    continue;
                }
                if !restriction.operations.is_empty()
                    && !restriction.operations.contains(&parsed.sql_type)
                {
                    continue;
                }

                if restriction.require_where
                    && !parsed.has_where_clause()
                    && matches!(parsed.sql_type, SqlType::Delete | SqlType::Update)
                {
                    severity = severity.max(PolicySeverity::Error);
                    violation_reasons.push(format!(
                        "{} on {table} requires WHERE clause",
                        sql_type_name(parsed.sql_type)
                    ));
                    matched_rules.push(format!(
                        "require_where:{table}:{}",
                        sql_type_name(parsed.sql_type)
                    ));
                }

                if let (Some(max_rows), Some(rows)) = (restriction.max_rows, estimated_rows) {
                    if rows > max_rows {
                        severity = severity.max(PolicySeverity::Error);
                        violation_reasons.push(format!(
                            "{} on {table} affects too many rows ({rows} > {max_rows})",
                            sql_type_name(parsed.sql_type)
                        ));
                        matched_rules.push(format!("row_limit:{table}:{max_rows}"));
                    }
                }

                for column in &parsed.columns {
                    if restriction.forbidden_columns.iter().any(|c| c == column) {
                        severity = severity.max(PolicySeverity::Error);
                        violation_reasons
                            .push(format!("Column {column} is forbidden for modification"));
                        matched_rules.push(format!("forbidden_column:{column}"));
                    }
                }

                if let Some(allowed) = &restriction.allowed_columns {
                    for column in &parsed.columns {
                        if !allowed.iter().any(|c| c == column) {
                            severity = severity.max(PolicySeverity::Error);
                            violation_reasons.push(format!("Column {column} is not in allowed list"));
                            matched_rules.push(format!("not_allowed_column:{column}"));
                        }
                    }
                }
            }
        }

        // Step 5: global row limits.
        if let Some(rows) = estimated_rows {
            for limit in &self.policy.row_limits {
                if limit.operation != parsed.sql_type || rows <= limit.max_rows {
                    continue;
                }
                if limit.action_severity >= severity {
                    severity = limit.action_severity;
                }
                let message = format!(
                    "{} affects too many rows ({rows} > {})",
                    sql_type_name(parsed.sql_type),
                    limit.max_rows
                );
                if limit.action_severity >= PolicySeverity::Error {
                    violation_reasons.push(message);
                } else {
                    warnings.push(message);
                }
                matched_rules.push(format!(
                    "global_row_limit:{}:{}",
                    sql_type_name(parsed.sql_type),
                    limit.max_rows
                ));
            }
        }

        let allowed = severity < PolicySeverity::Error;
        let flagged = allowed && severity == PolicySeverity::Warning;

        PolicyEvaluation {
            allowed,
            flagged,
            severity,
            matched_rules,
            violation_reasons,
            warnings,
        }
    }
}

/// Table-pattern matching: `*` matches everything, a pattern
/// containing `*` is a glob (translated to a regex), otherwise an
/// exact case-insensitive comparison (§4.3 step 4).
fn table_matches(table: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('*') {
        let escaped = regex::escape(pattern).replace("\\*", ".*");
        match Regex::new(&format!("(?i)^{escaped}$")) {
            Ok(re) => re.is_match(table),
            Err(_) => false,
        }
    } else {
        table.eq_ignore_ascii_case(pattern)
    }
}

fn sql_type_name(sql_type: SqlType) -> &'static str {
    match sql_type {
        SqlType::Select => "SELECT",
        SqlType::Insert => "INSERT",
        SqlType::Update => "UPDATE",
        SqlType::Delete => "DELETE",
        SqlType::Create => "CREATE",
        SqlType::Alter => "ALTER",
        SqlType::Drop => "DROP",
        SqlType::Truncate => "TRUNCATE",
        SqlType::Grant => "GRANT",
        SqlType::Revoke => "REVOKE",
        SqlType::Begin => "BEGIN",
        SqlType::Commit => "COMMIT",
        SqlType::Rollback => "ROLLBACK",
        SqlType::Other => "OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_analyzer::StatementAnalyzer;
    use chaostrace_model::{ForbiddenSqlRule, HoneypotConfig, TableRestriction};

    fn strict_policy() -> PolicyDefinition {
        PolicyDefinition {
            name: "strict".to_string(),
            version: "1.0".to_string(),
            description: String::new(),
            forbidden_sql: vec![ForbiddenSqlRule {
                pattern: r"DROP\s+DATABASE".to_string(),
                severity: PolicySeverity::Critical,
                message: Some("DROP DATABASE is never allowed".to_string()),
                case_sensitive: false,
            }],
            table_restrictions: vec![TableRestriction {
                table_pattern: "*".to_string(),
                operations: vec![SqlType::Delete, SqlType::Update],
                require_where: true,
                max_rows: None,
                allowed_columns: None,
                forbidden_columns: vec![],
            }],
            row_limits: vec![],
            honeypots: HoneypotConfig {
                tables: vec!["_secrets".to_string()],
                columns: vec![],
                files: vec![],
                severity: PolicySeverity::Critical,
            },
            fail_on_unknown_table: false,
            require_transaction: false,
            max_query_length: 10_000,
        }
    }

    fn evaluate(sql: &str) -> PolicyEvaluation {
        let analyzer = StatementAnalyzer::new();
        let parsed = analyzer.parse(sql);
        let engine = PolicyEngine::from_definition(strict_policy()).unwrap();
        engine.evaluate(sql, &parsed, None)
    }

    #[test]
    fn simple_allow() {
        let eval = evaluate("SELECT id, name FROM users WHERE id = 1");
        assert!(eval.allowed);
        assert!(!eval.flagged);
    }

    #[test]
    fn delete_without_where_is_blocked() {
        let eval = evaluate("DELETE FROM users");
        assert!(!eval.allowed);
        assert!(eval
            .violation_reasons
            .iter()
            .any(|r| r.contains("requires WHERE clause")));
    }

    #[test]
    fn honeypot_table_is_blocked_critical() {
        let eval = evaluate("SELECT * FROM _secrets");
        assert!(!eval.allowed);
        assert_eq!(eval.severity, PolicySeverity::Critical);
        assert!(eval
            .matched_rules
            .iter()
            .any(|r| r == "honeypot_table:_secrets"));
    }

    #[test]
    fn forbidden_pattern_blocks() {
        let eval = evaluate("DROP DATABASE sandbox");
        assert!(!eval.allowed);
    }

    #[test]
    fn table_wildcard_matches() {
        assert!(table_matches("orders_2024", "orders_*"));
        assert!(!table_matches("users", "orders_*"));
        assert!(table_matches("Users", "users"));
    }
}
