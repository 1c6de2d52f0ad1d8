//! The statement analyzer's output type: an immutable structural
//! fingerprint of one SQL statement.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Coarse classification of a parsed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlType {
    /// `SELECT`
    Select,
    /// `INSERT`
    Insert,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
    /// `CREATE`
    Create,
    /// `ALTER`
    Alter,
    /// `DROP`
    Drop,
    /// `TRUNCATE`
    Truncate,
    /// `GRANT`
    Grant,
    /// `REVOKE`
    Revoke,
    /// `BEGIN` (and `START TRANSACTION`, which aliases to this)
    Begin,
    /// `COMMIT`
    Commit,
    /// `ROLLBACK`
    Rollback,
    /// Anything the classifier could not place.
    Other,
}

impl SqlType {
    /// Whether this type is one of the three transaction-control
    /// statements, treated together by the risk scorer's base table.
    pub fn is_transaction_control(self) -> bool {
        matches!(self, SqlType::Begin | SqlType::Commit | SqlType::Rollback)
    }
}

/// Structural flags the analyzer derives from the parsed AST, used by
/// the risk scorer and policy engine without needing to re-inspect the
/// statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralFlags {
    /// The statement has a `WHERE` clause.
    pub has_where: bool,
    /// The statement has a `LIMIT` clause.
    pub has_limit: bool,
    /// The statement has an `ORDER BY` clause.
    pub has_order_by: bool,
    /// The statement selects `*` somewhere in its projection.
    pub is_select_star: bool,
    /// The statement contains at least one subquery.
    pub has_subquery: bool,
    /// The statement contains an aggregation (`COUNT`, `SUM`, ...).
    pub has_aggregation: bool,
    /// Number of joins in the statement.
    pub join_count: u32,
    /// Number of subqueries in the statement.
    pub subquery_count: u32,
    /// The statement contains a window function.
    pub has_window: bool,
    /// The statement contains a common table expression.
    pub has_cte: bool,
}

/// Immutable derivation from one raw SQL string. Never fails to
/// produce: on parser failure, every field the prefix classifier can
/// still supply is populated and `is_valid` is `false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedStatement {
    /// Coarse statement classification. Always populated, even when
    /// `is_valid` is `false`.
    pub sql_type: SqlType,
    /// Table identifiers referenced by the statement.
    pub tables: BTreeSet<String>,
    /// Column identifiers referenced by the statement.
    pub columns: BTreeSet<String>,
    /// Structural flags derived from the AST.
    pub flags: StructuralFlags,
    /// Complexity score in `1..=10`.
    pub complexity: u8,
    /// First 16 hex characters of the SHA-256 of the
    /// whitespace-normalized statement text.
    pub statement_hash: String,
    /// Whether the dialect-aware parser succeeded.
    pub is_valid: bool,
    /// The parser's error message, populated only when `is_valid` is
    /// `false`.
    pub parse_error: Option<String>,
}

impl ParsedStatement {
    /// Convenience accessor mirroring the distilled spec's
    /// `has_where_clause` naming used throughout the risk scorer and
    /// policy engine.
    pub fn has_where_clause(&self) -> bool {
        self.flags.has_where
    }
}
