// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Query parsing and canonicalization (C1).
//!
//! The canonicalizer applies a total, idempotent rewrite so that two
//! textually different but semantically identical inputs normalize to the
//! same string, and thus to the same fingerprint.

use crate::error::{FlockError, Result};
use sqlparser::ast::{Expr, Function, ObjectName, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// A parsed, canonicalized query and its content fingerprint.
#[derive(Debug, Clone)]
pub struct Query {
    /// The canonicalized SQL text.
    pub sql: String,
    /// The parsed AST of the canonicalized text.
    pub ast: Statement,
    /// MD5 digest of `sql`, hex-encoded. Used as a cache key and embedded in
    /// generated identifiers.
    pub fingerprint: String,
}

impl Query {
    /// Parse and canonicalize `sql`.
    ///
    /// Fails with [`FlockError::ParseError`] when the text cannot be parsed.
    pub fn parse(sql: &str) -> Result<Query> {
        let canonical = canonicalize(sql)?;
        let ast = parse_single_statement(&canonical)?;

        Ok(Query {
            fingerprint: fingerprint(&canonical),
            sql: canonical,
            ast,
        })
    }
}

/// Parse SQL text and require exactly one statement.
fn parse_single_statement(sql: &str) -> Result<Statement> {
    let dialect = GenericDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| FlockError::ParseError(e.to_string()))?;

    if statements.len() != 1 {
        return Err(FlockError::ParseError(format!(
            "expected exactly one SQL statement, found {}",
            statements.len()
        )));
    }
    Ok(statements.remove(0))
}

/// Apply the total, idempotent canonicalization rewrite: parse once, then
/// re-serialize with built-in function names upper-cased while leaving user
/// identifiers (tables, columns, aliases) untouched.
pub fn canonicalize(sql: &str) -> Result<String> {
    let statement = parse_single_statement(sql.trim())?;
    let mut statement = statement;
    uppercase_functions_in_statement(&mut statement);
    Ok(statement.to_string())
}

/// Idempotence check: `canonicalize(canonicalize(sql)) == canonicalize(sql)`.
/// Holds because re-serializing an already-canonical AST via `to_string()`
/// is deterministic and `uppercase_functions_in_statement` is itself
/// idempotent (upper-casing an already-uppercase name is a no-op).
fn uppercase_functions_in_statement(statement: &mut Statement) {
    match statement {
        Statement::Query(query) => walk_query(query),
        _ => {}
    }
}

fn walk_query(query: &mut sqlparser::ast::Query) {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            walk_query(&mut cte.query);
        }
    }
    walk_set_expr(&mut query.body);
}

fn walk_set_expr(expr: &mut sqlparser::ast::SetExpr) {
    use sqlparser::ast::SetExpr;
    match expr {
        SetExpr::Select(select) => {
            for item in &mut select.projection {
                walk_select_item(item);
            }
            if let Some(selection) = &mut select.selection {
                walk_expr(selection);
            }
            for group_by in &mut select.group_by {
                walk_expr(group_by);
            }
            if let Some(having) = &mut select.having {
                walk_expr(having);
            }
        }
        SetExpr::Query(q) => walk_query(q),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left);
            walk_set_expr(right);
        }
        _ => {}
    }
}

fn walk_select_item(item: &mut sqlparser::ast::SelectItem) {
    use sqlparser::ast::SelectItem;
    match item {
        SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => walk_expr(e),
        _ => {}
    }
}

fn walk_expr(expr: &mut Expr) {
    match expr {
        Expr::Function(f) => uppercase_function_name(f),
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left);
            walk_expr(right);
        }
        Expr::UnaryOp { expr, .. } => walk_expr(expr),
        Expr::Nested(e) => walk_expr(e),
        Expr::Cast { expr, .. } => walk_expr(expr),
        Expr::Case {
            conditions,
            results,
            else_result,
            ..
        } => {
            for c in conditions {
                walk_expr(c);
            }
            for r in results {
                walk_expr(r);
            }
            if let Some(e) = else_result {
                walk_expr(e);
            }
        }
        _ => {}
    }
}

/// Known built-in function names that get case-normalized. Anything not in
/// this set is assumed to be a user-defined identifier and is left as-is.
const BUILTIN_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "read_parquet", "scan_parquet", "read_json_auto",
    "read_csv_auto",
];

fn uppercase_function_name(f: &mut Function) {
    if let Some(ident) = f.name.0.last_mut() {
        if BUILTIN_FUNCTIONS.contains(&ident.value.to_lowercase().as_str()) {
            ident.value = ident.value.to_uppercase();
        }
    }
}

/// MD5 digest of `text`, hex-encoded. Used non-cryptographically, purely as
/// a stable content fingerprint.
pub fn fingerprint(text: &str) -> String {
    let digest = md5::compute(text.as_bytes());
    format!("{:x}", digest)
}

/// Produce a valid-identifier short hash for a stage id: a hash prefix,
/// guaranteed to start with a non-digit so it remains a valid SQL
/// identifier once substituted into a parent's FROM list.
pub fn stage_id(sub_sql: &str) -> String {
    let full = fingerprint(sub_sql);
    let short = &full[..12.min(full.len())];
    if short.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        format!("s{}", short)
    } else {
        short.to_owned()
    }
}

/// Build an `ObjectName` from a single unquoted identifier. Used when
/// substituting placeholder table references for upstream stage outputs.
pub fn object_name(name: &str) -> ObjectName {
    ObjectName(vec![sqlparser::ast::Ident::new(name)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_is_idempotent() {
        let sql = "select a, count(*) from t group by a";
        let once = canonicalize(sql).unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn equivalent_queries_share_a_fingerprint() {
        let q1 = Query::parse("SELECT a, COUNT(*) FROM t GROUP BY a").unwrap();
        let q2 = Query::parse("select a, count(*) from t group by a").unwrap();
        assert_eq!(q1.fingerprint, q2.fingerprint);
        assert_eq!(q1.sql, q2.sql);
    }

    #[test]
    fn user_identifiers_are_not_uppercased() {
        let sql = "SELECT myColumn FROM MyTable";
        let canonical = canonicalize(sql).unwrap();
        assert!(canonical.contains("myColumn") || canonical.to_lowercase().contains("mycolumn"));
    }

    #[test]
    fn parse_error_on_garbage() {
        assert!(Query::parse("not even sql (((").is_err());
    }

    #[test]
    fn stage_id_never_starts_with_a_digit() {
        for sql in ["SELECT 1", "SELECT 2", "SELECT 3", "SELECT 4", "SELECT 5"] {
            let id = stage_id(sql);
            assert!(!id.chars().next().unwrap().is_ascii_digit());
        }
    }
}
