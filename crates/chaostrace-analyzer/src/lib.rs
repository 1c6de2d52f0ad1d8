//! §4.1 Statement Analyzer: parses one raw SQL string into a
//! [`ParsedStatement`] fingerprint. Never panics and never returns an
//! error — a parse failure still produces a usable, if less detailed,
//! fingerprint via the first-keyword prefix classifier (§3's
//! invariant that `sql_type` is always populated).

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use chaostrace_model::{ParsedStatement, SqlType, StructuralFlags};
use sha2::{Digest, Sha256};
use sqlparser::ast::{
    Expr, ObjectName, SelectItem, SetExpr, Statement, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Parses SQL statements for the PostgreSQL dialect, the only wire
/// protocol this workspace's proxy speaks (§1 Non-goals).
#[derive(Debug, Default, Clone, Copy)]
pub struct StatementAnalyzer;

impl StatementAnalyzer {
    /// Construct a new analyzer. Stateless; cheap to construct per
    /// connection or share across connections.
    pub fn new() -> Self {
        Self
    }

    /// Parse `sql` into a [`ParsedStatement`]. Contract: never panics,
    /// `sql_type` is always populated.
    pub fn parse(&self, sql: &str) -> ParsedStatement {
        let sql = sql.trim();
        let statement_hash = compute_hash(sql);

        if sql.is_empty() {
            return ParsedStatement {
                sql_type: SqlType::Other,
                tables: BTreeSet::new(),
                columns: BTreeSet::new(),
                flags: StructuralFlags::default(),
                complexity: 1,
                statement_hash,
                is_valid: false,
                parse_error: Some("empty statement".to_string()),
            };
        }

        let dialect = PostgreSqlDialect {};
        match Parser::parse_sql(&dialect, sql) {
            Ok(statements) if !statements.is_empty() => {
                analyze(&statements[0], statement_hash)
            }
            Ok(_) => ParsedStatement {
                sql_type: classify_by_prefix(sql),
                tables: BTreeSet::new(),
                columns: BTreeSet::new(),
                flags: StructuralFlags::default(),
                complexity: 1,
                statement_hash,
                is_valid: false,
                parse_error: Some("no statements parsed".to_string()),
            },
            Err(e) => ParsedStatement {
                sql_type: classify_by_prefix(sql),
                tables: BTreeSet::new(),
                columns: BTreeSet::new(),
                flags: StructuralFlags::default(),
                complexity: 1,
                statement_hash,
                is_valid: false,
                parse_error: Some(e.to_string()),
            },
        }
    }

    /// Normalize `sql` for comparison/caching purposes: re-render the
    /// parsed AST, falling back to whitespace collapsing if parsing
    /// fails (§4.1 supplemental `normalize()`, §10.2).
    pub fn normalize(&self, sql: &str) -> String {
        let dialect = PostgreSqlDialect {};
        match Parser::parse_sql(&dialect, sql.trim()) {
            Ok(statements) if !statements.is_empty() => statements[0].to_string(),
            _ => collapse_whitespace(sql),
        }
    }
}

fn collapse_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First 16 hex characters of the SHA-256 of the whitespace-normalized
/// statement, so semantically-identical statements share a hash (§4.1,
/// §8 invariant 2).
fn compute_hash(sql: &str) -> String {
    let normalized = collapse_whitespace(sql);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Fallback classifier used when the dialect-aware parser fails: the
/// first keyword of the statement (§4.1, `original_source`'s
/// `_classify_by_prefix`).
fn classify_by_prefix(sql: &str) -> SqlType {
    let upper = sql.trim_start().to_uppercase();
    const PREFIXES: &[(&str, SqlType)] = &[
        ("SELECT", SqlType::Select),
        ("INSERT", SqlType::Insert),
        ("UPDATE", SqlType::Update),
        ("DELETE", SqlType::Delete),
        ("CREATE", SqlType::Create),
        ("ALTER", SqlType::Alter),
        ("DROP", SqlType::Drop),
        ("TRUNCATE", SqlType::Truncate),
        ("GRANT", SqlType::Grant),
        ("REVOKE", SqlType::Revoke),
        ("BEGIN", SqlType::Begin),
        ("START", SqlType::Begin),
        ("COMMIT", SqlType::Commit),
        ("ROLLBACK", SqlType::Rollback),
    ];
    for (prefix, sql_type) in PREFIXES {
        if upper.starts_with(prefix) {
            return *sql_type;
        }
    }
    SqlType::Other
}

/// The plain text of an `ObjectName`'s last segment (the table or
/// function name itself, ignoring any schema/catalog qualifier).
/// `ObjectName` renders its unquoted identifier text through `Display`
/// the same way across `sqlparser` releases, so going through
/// `to_string()` here is more resilient to the crate's occasional
/// internal reshuffling of `ObjectName`'s segment type than matching
/// on its fields directly.
fn object_name_tail(name: &ObjectName) -> Option<String> {
    name.0.last().map(|part| part.to_string())
}

fn statement_sql_type(statement: &Statement) -> SqlType {
    match statement {
        Statement::Query(_) => SqlType::Select,
        Statement::Insert(_) => SqlType::Insert,
        Statement::Update { .. } => SqlType::Update,
        Statement::Delete(_) => SqlType::Delete,
        Statement::CreateTable(_) | Statement::CreateView { .. } | Statement::CreateIndex(_) => {
            SqlType::Create
        }
        Statement::AlterTable { .. } | Statement::AlterIndex { .. } => SqlType::Alter,
        Statement::Drop { .. } => SqlType::Drop,
        Statement::Truncate { .. } => SqlType::Truncate,
        Statement::Grant { .. } => SqlType::Grant,
        Statement::Revoke { .. } => SqlType::Revoke,
        Statement::StartTransaction { .. } => SqlType::Begin,
        Statement::Commit { .. } => SqlType::Commit,
        Statement::Rollback { .. } => SqlType::Rollback,
        _ => SqlType::Other,
    }
}

/// Walks the AST collecting every referenced table and column, using
/// the crate's generic `Visitor` so every statement kind (SELECT,
/// INSERT, UPDATE, DELETE, ...) is covered without hand-matching each
/// one's field shape.
#[derive(Default)]
struct Collector {
    tables: BTreeSet<String>,
    columns: BTreeSet<String>,
    subquery_count: u32,
    has_window: bool,
    has_aggregation: bool,
}

impl Visitor for Collector {
    type Break = ();

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(name) = object_name_tail(relation) {
            self.tables.insert(name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                self.columns.insert(ident.value.clone());
            }
            Expr::CompoundIdentifier(idents) => {
                if let Some(last) = idents.last() {
                    self.columns.insert(last.value.clone());
                }
            }
            Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. } => {
                self.subquery_count += 1;
            }
            Expr::Function(f) => {
                if f.over.is_some() {
                    self.has_window = true;
                }
                if let Some(name) = object_name_tail(&f.name) {
                    let upper = name.to_uppercase();
                    if matches!(upper.as_str(), "COUNT" | "SUM" | "AVG" | "MIN" | "MAX") {
                        self.has_aggregation = true;
                    }
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn analyze(statement: &Statement, statement_hash: String) -> ParsedStatement {
    let sql_type = statement_sql_type(statement);

    let mut collector = Collector::default();
    let _ = statement.visit(&mut collector);

    let (has_where, has_limit, has_order_by, is_select_star, has_cte, join_count) =
        top_level_flags(statement);

    let flags = StructuralFlags {
        has_where,
        has_limit,
        has_order_by,
        is_select_star,
        has_subquery: collector.subquery_count > 0,
        has_aggregation: collector.has_aggregation,
        join_count,
        subquery_count: collector.subquery_count,
        has_window: collector.has_window,
        has_cte,
    };

    let complexity = estimate_complexity(&collector.tables, join_count, collector.subquery_count, &flags);

    ParsedStatement {
        sql_type,
        tables: collector.tables,
        columns: collector.columns,
        flags,
        complexity,
        statement_hash,
        is_valid: true,
        parse_error: None,
    }
}

/// Extracts the flags that only make sense at the top level of the
/// statement (a nested subquery's own WHERE/LIMIT must not leak into
/// these), by matching directly on the statement's own structure
/// rather than the generic visitor.
fn top_level_flags(statement: &Statement) -> (bool, bool, bool, bool, bool, u32) {
    match statement {
        Statement::Query(query) => {
            let has_cte = query.with.is_some();
            let has_limit = query.limit.is_some();
            let has_order_by = query.order_by.is_some();
            match query.body.as_ref() {
                SetExpr::Select(select) => {
                    let has_where = select.selection.is_some();
                    let is_select_star = select.projection.iter().any(|item| {
                        matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..))
                    });
                    let join_count: u32 = select
                        .from
                        .iter()
                        .map(|twj| twj.joins.len() as u32)
                        .sum();
                    (has_where, has_limit, has_order_by, is_select_star, has_cte, join_count)
                }
                _ => (false, has_limit, has_order_by, false, has_cte, 0),
            }
        }
        Statement::Update { selection, .. } => (selection.is_some(), false, false, false, false, 0),
        Statement::Delete(delete) => (delete.selection.is_some(), false, false, false, false, 0),
        _ => (false, false, false, false, false, 0),
    }
}

/// §4.1's complexity formula.
fn estimate_complexity(
    tables: &BTreeSet<String>,
    join_count: u32,
    subquery_count: u32,
    flags: &StructuralFlags,
) -> u8 {
    let mut complexity: i32 = 1;
    complexity += (tables.len() as i32 - 1).clamp(0, 2);
    complexity += (join_count as i32).clamp(0, 3);
    complexity += (2 * subquery_count as i32).clamp(0, 4);
    if flags.has_window {
        complexity += 1;
    }
    if flags.has_cte {
        complexity += 1;
    }
    complexity.clamp(1, 10) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_model::SqlType;

    #[test]
    fn simple_select_with_where() {
        let analyzer = StatementAnalyzer::new();
        let parsed = analyzer.parse("SELECT id, name FROM users WHERE id = 1");
        assert_eq!(parsed.sql_type, SqlType::Select);
        assert!(parsed.is_valid);
        assert!(parsed.tables.contains("users"));
        assert!(parsed.flags.has_where);
        assert!(!parsed.flags.is_select_star);
    }

    #[test]
    fn select_star_is_flagged() {
        let analyzer = StatementAnalyzer::new();
        let parsed = analyzer.parse("SELECT * FROM _secrets");
        assert!(parsed.flags.is_select_star);
        assert!(parsed.tables.contains("_secrets"));
    }

    #[test]
    fn delete_without_where_has_no_where_flag() {
        let analyzer = StatementAnalyzer::new();
        let parsed = analyzer.parse("DELETE FROM users");
        assert_eq!(parsed.sql_type, SqlType::Delete);
        assert!(!parsed.flags.has_where);
        assert!(parsed.tables.contains("users"));
    }

    #[test]
    fn whitespace_normalized_statements_share_a_hash() {
        let analyzer = StatementAnalyzer::new();
        let a = analyzer.parse("SELECT   1");
        let b = analyzer.parse("SELECT 1");
        assert_eq!(a.statement_hash, b.statement_hash);
    }

    #[test]
    fn unparseable_sql_still_yields_a_sql_type() {
        let analyzer = StatementAnalyzer::new();
        let parsed = analyzer.parse("DELETE FROM users WHERE (((");
        assert!(!parsed.is_valid);
        assert_eq!(parsed.sql_type, SqlType::Delete);
        assert!(parsed.parse_error.is_some());
    }

    #[test]
    fn join_and_subquery_bump_complexity() {
        let analyzer = StatementAnalyzer::new();
        let parsed = analyzer.parse(
            "SELECT u.id FROM users u JOIN orders o ON o.user_id = u.id \
             WHERE u.id IN (SELECT user_id FROM banned)",
        );
        assert!(parsed.flags.join_count >= 1);
        assert!(parsed.flags.has_subquery);
        assert!(parsed.complexity > 1);
    }
}
