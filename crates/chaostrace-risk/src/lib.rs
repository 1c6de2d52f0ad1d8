//! §4.2 Risk Scorer: a pure, deterministic function of one parsed
//! statement and the scorer's static configuration. Performs no I/O
//! and never fails — there is nothing here for a caller to handle
//! beyond the returned [`RiskAssessment`].

use std::collections::HashSet;

use chaostrace_model::{ParsedStatement, RiskAssessment, RiskLevel, SqlType};

/// Row-count thresholds past which the scorer escalates risk based on
/// an estimated row count (§4.2 step 6).
#[derive(Debug, Clone, Copy)]
pub struct RowThresholds {
    /// At or above this estimate, risk is raised to at least MEDIUM.
    pub low_to_medium: u64,
    /// At or above this estimate, risk is raised to at least HIGH.
    pub medium_to_high: u64,
    /// At or above this estimate, risk is raised to CRITICAL.
    pub high_to_critical: u64,
}

impl Default for RowThresholds {
    fn default() -> Self {
        Self {
            low_to_medium: 100,
            medium_to_high: 1_000,
            high_to_critical: 10_000,
        }
    }
}

/// Scores the risk of parsed SQL statements against a configured set
/// of sensitive tables and row thresholds.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    sensitive_tables: HashSet<String>,
    row_thresholds: RowThresholds,
}

fn default_sensitive_tables() -> HashSet<String> {
    [
        "users",
        "accounts",
        "passwords",
        "credentials",
        "secrets",
        "api_keys",
        "tokens",
        "sessions",
        "audit_logs",
        "payments",
        "transactions",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
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

/// §4.2 step 1's fixed base-risk table.
fn base_risk(sql_type: SqlType) -> RiskLevel {
    match sql_type {
        SqlType::Drop | SqlType::Truncate => RiskLevel::Critical,
        SqlType::Delete | SqlType::Alter | SqlType::Grant | SqlType::Revoke => RiskLevel::High,
        SqlType::Update | SqlType::Create | SqlType::Other => RiskLevel::Medium,
        SqlType::Insert | SqlType::Select => RiskLevel::Low,
        SqlType::Begin | SqlType::Commit | SqlType::Rollback => RiskLevel::Low,
    }
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self {
            sensitive_tables: default_sensitive_tables(),
            row_thresholds: RowThresholds::default(),
        }
    }
}

impl RiskScorer {
    /// Construct a scorer with the default sensitive-table set and
    /// row thresholds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a scorer with a custom sensitive-table set and/or row
    /// thresholds.
    pub fn with_config(sensitive_tables: HashSet<String>, row_thresholds: RowThresholds) -> Self {
        Self {
            sensitive_tables,
            row_thresholds,
        }
    }

    /// Assess the risk of one parsed statement (§4.2's algorithm,
    /// steps 1-6, in order).
    pub fn assess(&self, parsed: &ParsedStatement) -> RiskAssessment {
        let mut factors = Vec::new();
        let mut confidence = 1.0;

        if !parsed.is_valid {
            factors.push("Parse error - treating as potentially risky".to_string());
            confidence = 0.5;
        }

        // Step 1: base risk by sql_type.
        let mut risk = base_risk(parsed.sql_type);

        // Step 2: sensitive-table escalation (case-insensitive).
        let sensitive_hit: Vec<&String> = parsed
            .tables
            .iter()
            .filter(|t| self.sensitive_tables.iter().any(|s| s.eq_ignore_ascii_case(t)))
            .collect();
        if !sensitive_hit.is_empty() {
            risk = risk.escalate();
            let names: Vec<&str> = sensitive_hit.iter().map(|s| s.as_str()).collect();
            factors.push(format!("Sensitive table(s): {}", names.join(", ")));
        }

        // Step 3: DELETE/UPDATE without WHERE.
        if matches!(parsed.sql_type, SqlType::Delete | SqlType::Update) && !parsed.has_where_clause() {
            risk = risk.escalate();
            factors.push(format!("{} without WHERE clause", sql_type_name(parsed.sql_type)));
        }

        // Step 4: SELECT * on a sensitive table is at least MEDIUM.
        if parsed.flags.is_select_star && !sensitive_hit.is_empty() {
            risk = risk.at_least(RiskLevel::Medium);
            factors.push("SELECT * on sensitive table".to_string());
        }

        // Step 5: complexity / subquery count.
        if parsed.complexity >= 7 {
            factors.push(format!("High query complexity ({}/10)", parsed.complexity));
            if risk == RiskLevel::Low {
                risk = RiskLevel::Medium;
            }
        }
        if parsed.flags.subquery_count > 2 {
            factors.push(format!("Multiple subqueries ({})", parsed.flags.subquery_count));
            if risk == RiskLevel::Low {
                risk = RiskLevel::Medium;
            }
        }

        // Step 6: estimated rows.
        let rows_estimated = self.estimate_rows(parsed);
        if let Some(rows) = rows_estimated {
            risk = self.adjust_risk_by_rows(risk, rows, &mut factors);
        }

        let recommendation = self.generate_recommendation(parsed, risk);

        RiskAssessment {
            risk_level: risk,
            risk_factors: factors,
            rows_estimated,
            confidence,
            recommendation,
        }
    }

    /// Row-estimate heuristic (§4.2 step 6): the only case the scorer
    /// can estimate without live table statistics is an unscoped
    /// DELETE/UPDATE, assumed worst-case at one million rows.
    fn estimate_rows(&self, parsed: &ParsedStatement) -> Option<u64> {
        if matches!(parsed.sql_type, SqlType::Delete | SqlType::Update) && !parsed.has_where_clause() {
            Some(1_000_000)
        } else {
            None
        }
    }

    fn adjust_risk_by_rows(&self, risk: RiskLevel, rows: u64, factors: &mut Vec<String>) -> RiskLevel {
        if rows >= self.row_thresholds.high_to_critical {
            factors.push(format!("Very high row impact ({rows} rows)"));
            RiskLevel::Critical
        } else if rows >= self.row_thresholds.medium_to_high {
            factors.push(format!("High row impact ({rows} rows)"));
            risk.at_least(RiskLevel::High)
        } else if rows >= self.row_thresholds.low_to_medium {
            factors.push(format!("Moderate row impact ({rows} rows)"));
            risk.at_least(RiskLevel::Medium)
        } else {
            risk
        }
    }

    fn generate_recommendation(&self, parsed: &ParsedStatement, risk: RiskLevel) -> String {
        match risk {
            RiskLevel::Critical => match parsed.sql_type {
                SqlType::Drop => "BLOCK: DROP statements are not allowed".to_string(),
                SqlType::Truncate => "BLOCK: TRUNCATE statements are not allowed".to_string(),
                _ => "BLOCK: Operation has critical risk level".to_string(),
            },
            RiskLevel::High => {
                if !parsed.has_where_clause() {
                    "BLOCK: Add WHERE clause to limit scope".to_string()
                } else {
                    "FLAG: Review before allowing".to_string()
                }
            }
            RiskLevel::Medium => "ALLOW: Monitor for anomalies".to_string(),
            RiskLevel::Low => "ALLOW: Low risk operation".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_analyzer::StatementAnalyzer;

    fn assess(sql: &str) -> RiskAssessment {
        let analyzer = StatementAnalyzer::new();
        let parsed = analyzer.parse(sql);
        RiskScorer::new().assess(&parsed)
    }

    #[test]
    fn simple_select_on_a_sensitive_table_is_escalated_to_medium() {
        // "users" is in the default sensitive-table set, so step 2's
        // escalation bumps the base LOW one level even with a WHERE
        // clause present.
        let a = assess("SELECT id, name FROM users WHERE id = 1");
        assert_eq!(a.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn delete_without_where_is_at_least_high() {
        let a = assess("DELETE FROM users");
        assert!(a.risk_level >= RiskLevel::High);
        assert_eq!(a.rows_estimated, Some(1_000_000));
    }

    #[test]
    fn delete_without_where_on_sensitive_table_is_critical() {
        let a = assess("DELETE FROM users");
        assert_eq!(a.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn drop_is_critical() {
        let a = assess("DROP TABLE users");
        assert_eq!(a.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn select_star_on_sensitive_table_is_at_least_medium() {
        let a = assess("SELECT * FROM users");
        assert!(a.risk_level >= RiskLevel::Medium);
    }
}
