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

//! The Planner (C3): lowers a parsed [`crate::query::Query`] into a DAG of
//! typed [`Stage`]s.
//!
//! CTE bodies are lowered depth-first into their own stages, keyed by alias,
//! before the main SELECT body is lowered; the alias map is threaded through
//! as an explicit per-recursion argument rather than a mutable default
//! argument or shared scratch state, so two branches of a plan can never
//! observe each other's in-progress aliases.

pub mod task;

use crate::error::{FlockError, Result};
use crate::query::{self, Query};
use crate::source::FileFormat;
use daggy::{Dag, NodeIndex, Walker};
use sqlparser::ast::{
    Expr, Function, Query as SqlQuery, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};
use std::collections::HashMap;

/// The operator family a stage implements; drives both fan-out policy (see
/// [`StageKind::is_partitionable`]) and how the Task Builder binds inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Scan,
    Aggregate,
    Sort,
    Join,
    Union,
}

impl StageKind {
    /// Only Scan stages are split across multiple tasks; every other kind is
    /// a wide operation that requires its full input set in one task.
    pub fn is_partitionable(&self) -> bool {
        matches!(self, StageKind::Scan)
    }
}

/// A leaf Scan stage's binding to its raw object-store source: the literal
/// text of the table expression that named it, and the format that
/// expression implies for both reading and (by the Task Builder, on the
/// stages downstream of it) writing.
#[derive(Debug, Clone)]
pub struct ScanBinding {
    /// The exact substring of the stage's `sub_sql` naming the source, e.g.
    /// `READ_PARQUET('s3://bucket/2024/*')` or a bare `s3://bucket/2024/*`.
    pub table_expr: String,
    pub format: FileFormat,
}

/// A node in the execution DAG.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: String,
    pub kind: StageKind,
    /// This stage's SQL, with every table reference already rewritten to
    /// either a placeholder identifier (for a dependency) or left as the raw
    /// source reference (for a leaf Scan).
    pub sub_sql: String,
    /// Alias to restore when this stage is substituted into a parent's FROM
    /// list (set only for stages reached via a subquery or CTE reference).
    pub alias: Option<String>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub scan: Option<ScanBinding>,
    /// The format dependency output files should be read/written in. For a
    /// Scan stage this is `scan.format`; for everything else it is inherited
    /// from the stage's primary (first) dependency.
    pub format: FileFormat,
}

/// A DAG of Stages plus the Query it was planned from.
pub struct Plan {
    pub query: Query,
    pub root_id: String,
    stages: HashMap<String, Stage>,
    dag: Dag<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl Plan {
    pub fn root(&self) -> &Stage {
        &self.stages[&self.root_id]
    }

    pub fn get(&self, id: &str) -> Option<&Stage> {
        self.stages.get(id)
    }

    /// Stages with no dependencies, i.e. every leaf Scan.
    pub fn leaves(&self) -> Vec<&Stage> {
        self.stages.values().filter(|s| s.dependencies.is_empty()).collect()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// A topological ordering of stage ids (dependencies before dependents),
    /// derived from the underlying `daggy::Dag`.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        daggy::petgraph::algo::toposort(self.dag.graph(), None)
            .map(|indices| indices.into_iter().map(|i| self.dag[i].clone()).collect())
            .map_err(|_| FlockError::Internal("stage DAG contains a cycle".to_owned()))
    }

    /// The direct dependencies of `id`, in the order the DAG recorded them.
    pub fn dependencies_of(&self, id: &str) -> Vec<&Stage> {
        let Some(&node) = self.nodes.get(id) else {
            return Vec::new();
        };
        self.dag
            .parents(node)
            .iter(&self.dag)
            .map(|(_, dep_node)| &self.stages[&self.dag[dep_node]])
            .collect()
    }
}

/// Lower `query` into a `Plan`.
///
/// Fails with [`FlockError::UnsupportedDialect`] when the query is not a
/// single `SELECT` statement, when a FROM list holds more than one
/// expression, or when a set operation (UNION/INTERSECT/EXCEPT) appears.
pub fn plan(query: &Query) -> Result<Plan> {
    let sql_query = match &query.ast {
        Statement::Query(q) => (**q).clone(),
        _ => {
            return Err(FlockError::UnsupportedDialect(
                "only SELECT queries can be planned".to_owned(),
            ))
        }
    };

    let mut stages = HashMap::new();
    let root_id = lower_query(&sql_query, &HashMap::new(), &mut stages)?;
    attach_dependents(&mut stages);

    let (dag, nodes) = build_dag(&stages)?;

    Ok(Plan {
        query: query.clone(),
        root_id,
        stages,
        dag,
        nodes,
    })
}

/// Lower one `Query` node (a SELECT, possibly preceded by a WITH clause)
/// into a stage, returning that stage's id.
///
/// `outer_ctes` is the alias -> stage id map visible from the enclosing
/// scope; this level's own CTEs are lowered on top of a clone of it so
/// siblings at this level can see each other but never leak into ancestors.
fn lower_query(
    q: &SqlQuery,
    outer_ctes: &HashMap<String, String>,
    stages: &mut HashMap<String, Stage>,
) -> Result<String> {
    let mut cte_ctx = outer_ctes.clone();

    if let Some(with) = &q.with {
        for cte in &with.cte_tables {
            let alias = cte.alias.name.value.clone();
            let child_id = lower_query(&cte.query, &cte_ctx, stages)?;
            if let Some(child) = stages.get_mut(&child_id) {
                child.alias = Some(alias.clone());
            }
            cte_ctx.insert(alias, child_id);
        }
    }

    let has_order_by = !q.order_by.is_empty();
    lower_set_expr(&q.body, has_order_by, &cte_ctx, stages)
}

fn lower_set_expr(
    body: &SetExpr,
    has_order_by: bool,
    cte_ctx: &HashMap<String, String>,
    stages: &mut HashMap<String, Stage>,
) -> Result<String> {
    match body {
        SetExpr::Select(select) => lower_select(select, has_order_by, cte_ctx, stages),
        SetExpr::Query(nested) => lower_query(nested, cte_ctx, stages),
        SetExpr::SetOperation { .. } => Err(FlockError::UnsupportedDialect(
            "UNION/INTERSECT/EXCEPT are not supported".to_owned(),
        )),
        _ => Err(FlockError::UnsupportedDialect(
            "unsupported query body".to_owned(),
        )),
    }
}

/// What a single FROM-list relation turned out to be once lowered.
enum RelationBinding {
    /// Binds to another stage: a subquery, a CTE alias, or a bare table
    /// promoted to its own child Scan because the enclosing stage is a wide
    /// operation (Aggregate/Sort/Join) and can only read dependency output.
    Dependency(String),
    /// The enclosing stage's own leaf Scan source.
    Scan(ScanBinding),
}

fn lower_select(
    select: &Select,
    has_order_by: bool,
    cte_ctx: &HashMap<String, String>,
    stages: &mut HashMap<String, Stage>,
) -> Result<String> {
    if select.from.len() != 1 {
        return Err(FlockError::UnsupportedDialect(
            "FROM list must contain exactly one expression".to_owned(),
        ));
    }

    let is_join = !select.from[0].joins.is_empty();
    let kind = if is_join {
        StageKind::Join
    } else if has_aggregate(select) {
        StageKind::Aggregate
    } else if has_order_by {
        StageKind::Sort
    } else {
        StageKind::Scan
    };

    let mut dependencies: Vec<String> = Vec::new();
    let mut scan: Option<ScanBinding> = None;

    let mut twj: TableWithJoins = select.from[0].clone();
    let (relation, binding) = lower_table_factor(twj.relation, kind, cte_ctx, stages)?;
    twj.relation = relation;
    apply_binding(binding, &mut dependencies, &mut scan);

    let mut joins = std::mem::take(&mut twj.joins);
    for join in joins.iter_mut() {
        let (relation, binding) = lower_table_factor(join.relation.clone(), kind, cte_ctx, stages)?;
        join.relation = relation;
        apply_binding(binding, &mut dependencies, &mut scan);
    }
    twj.joins = joins;

    let mut rewritten = select.clone();
    rewritten.from = vec![twj];

    dependencies.sort();
    dependencies.dedup();

    let format = match &scan {
        Some(binding) => binding.format,
        None => dependencies
            .first()
            .and_then(|id| stages.get(id))
            .map(|s| s.format)
            .unwrap_or(FileFormat::Parquet),
    };

    let sub_sql = rewritten.to_string();
    let id = query::stage_id(&sub_sql);

    stages.insert(
        id.clone(),
        Stage {
            id: id.clone(),
            kind,
            sub_sql,
            alias: None,
            dependencies,
            dependents: Vec::new(),
            scan,
            format,
        },
    );
    Ok(id)
}

fn apply_binding(
    binding: RelationBinding,
    dependencies: &mut Vec<String>,
    scan: &mut Option<ScanBinding>,
) {
    match binding {
        RelationBinding::Dependency(id) => dependencies.push(id),
        RelationBinding::Scan(b) => *scan = Some(b),
    }
}

/// Lower a single FROM-list relation, given the kind already decided for the
/// enclosing stage (which determines whether a bare table may stay inline as
/// this stage's own Scan source, or must be promoted to a child stage).
fn lower_table_factor(
    factor: TableFactor,
    kind: StageKind,
    cte_ctx: &HashMap<String, String>,
    stages: &mut HashMap<String, Stage>,
) -> Result<(TableFactor, RelationBinding)> {
    match factor {
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            let child_id = lower_query(&subquery, cte_ctx, stages)?;
            let restored_alias = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| child_id.clone());
            if let Some(child) = stages.get_mut(&child_id) {
                child.alias = Some(restored_alias);
            }
            Ok((
                TableFactor::Table {
                    name: query::object_name(&child_id),
                    alias,
                    args: Vec::new(),
                    with_hints: Vec::new(),
                },
                RelationBinding::Dependency(child_id),
            ))
        }
        TableFactor::Table {
            name,
            alias,
            args,
            with_hints,
        } => {
            let raw_name = name.to_string();
            let cte_hit = cte_ctx
                .get(&raw_name)
                .or_else(|| cte_ctx.get(&raw_name.to_lowercase()))
                .cloned();

            if let Some(dep_id) = cte_hit {
                Ok((
                    TableFactor::Table {
                        name: query::object_name(&dep_id),
                        alias,
                        args: Vec::new(),
                        with_hints: Vec::new(),
                    },
                    RelationBinding::Dependency(dep_id),
                ))
            } else if kind == StageKind::Scan {
                // `table_expr` excludes the alias so `build_scan_tasks`'s
                // substring replace leaves `" AS alias"` (rendered after the
                // name by sqlparser's `Display`) intact in the stage's
                // sub_sql rather than substituting it away along with the
                // reader call.
                let bare_expr = TableFactor::Table {
                    name: name.clone(),
                    alias: None,
                    args: args.clone(),
                    with_hints: with_hints.clone(),
                }
                .to_string();
                let format = FileFormat::infer(&bare_expr).unwrap_or(FileFormat::Parquet);
                let original = TableFactor::Table {
                    name,
                    alias,
                    args,
                    with_hints,
                };
                Ok((
                    original,
                    RelationBinding::Scan(ScanBinding {
                        table_expr: bare_expr,
                        format,
                    }),
                ))
            } else {
                let bare_expr = TableFactor::Table {
                    name: name.clone(),
                    alias: None,
                    args: args.clone(),
                    with_hints: with_hints.clone(),
                }
                .to_string();
                let format = FileFormat::infer(&bare_expr).unwrap_or(FileFormat::Parquet);

                let original = TableFactor::Table {
                    name,
                    alias: alias.clone(),
                    args,
                    with_hints,
                };
                let full_expr = original.to_string();

                let synthetic_sub_sql = format!("SELECT * FROM {}", full_expr);
                let child_id = query::stage_id(&synthetic_sub_sql);
                stages.entry(child_id.clone()).or_insert_with(|| Stage {
                    id: child_id.clone(),
                    kind: StageKind::Scan,
                    sub_sql: synthetic_sub_sql,
                    alias: alias.as_ref().map(|a| a.name.value.clone()),
                    dependencies: Vec::new(),
                    dependents: Vec::new(),
                    scan: Some(ScanBinding {
                        table_expr: bare_expr,
                        format,
                    }),
                    format,
                });

                Ok((
                    TableFactor::Table {
                        name: query::object_name(&child_id),
                        alias,
                        args: Vec::new(),
                        with_hints: Vec::new(),
                    },
                    RelationBinding::Dependency(child_id),
                ))
            }
        }
        other => Err(FlockError::UnsupportedDialect(format!(
            "unsupported FROM-list relation `{}`",
            other
        ))),
    }
}

fn has_aggregate(select: &Select) -> bool {
    if !select.group_by.is_empty() {
        return true;
    }
    select.projection.iter().any(|item| match item {
        SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
            expr_has_aggregate(e)
        }
        _ => false,
    })
}

fn expr_has_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Function(f) => is_aggregate_function(f),
        Expr::BinaryOp { left, right, .. } => expr_has_aggregate(left) || expr_has_aggregate(right),
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            expr_has_aggregate(expr)
        }
        _ => false,
    }
}

const AGGREGATE_FUNCTIONS: &[&str] = &["count", "sum", "avg", "min", "max"];

fn is_aggregate_function(f: &Function) -> bool {
    f.name
        .0
        .last()
        .map(|ident| AGGREGATE_FUNCTIONS.contains(&ident.value.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Wire each stage's `dependents` as the inverse of its `dependencies`.
fn attach_dependents(stages: &mut HashMap<String, Stage>) {
    let edges: Vec<(String, String)> = stages
        .values()
        .flat_map(|s| s.dependencies.iter().map(move |d| (d.clone(), s.id.clone())))
        .collect();
    for (dep_id, dependent_id) in edges {
        if let Some(dep) = stages.get_mut(&dep_id) {
            dep.dependents.push(dependent_id);
        }
    }
}

fn build_dag(stages: &HashMap<String, Stage>) -> Result<(Dag<String, ()>, HashMap<String, NodeIndex>)> {
    let mut dag = Dag::<String, ()>::new();
    let mut nodes = HashMap::new();
    for id in stages.keys() {
        nodes.insert(id.clone(), dag.add_node(id.clone()));
    }
    for stage in stages.values() {
        let dependent_node = nodes[&stage.id];
        for dep_id in &stage.dependencies {
            let dep_node = nodes[dep_id];
            dag.add_edge(dep_node, dependent_node, ())
                .map_err(|_| FlockError::Internal("stage DAG contains a cycle".to_owned()))?;
        }
    }
    Ok((dag, nodes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_scan_has_no_dependencies() {
        let q = Query::parse("SELECT a FROM READ_PARQUET('s3://bucket/2024/*')").unwrap();
        let p = plan(&q).unwrap();
        assert_eq!(p.stage_count(), 1);
        assert_eq!(p.root().kind, StageKind::Scan);
        assert!(p.root().dependencies.is_empty());
    }

    #[test]
    fn cte_plus_aggregate_produces_two_dependent_stages() {
        let q = Query::parse(
            "WITH x AS (SELECT a FROM READ_PARQUET('s3://b/*')) SELECT COUNT(*) FROM x",
        )
        .unwrap();
        let p = plan(&q).unwrap();
        assert_eq!(p.stage_count(), 2);
        assert_eq!(p.root().kind, StageKind::Aggregate);
        assert_eq!(p.root().dependencies.len(), 1);

        let scan_id = &p.root().dependencies[0];
        let scan = p.get(scan_id).unwrap();
        assert_eq!(scan.kind, StageKind::Scan);
        assert!(scan.dependents.contains(&p.root_id));
    }

    #[test]
    fn subquery_is_promoted_to_its_own_stage() {
        let q = Query::parse(
            "SELECT COUNT(*) FROM (SELECT a FROM READ_PARQUET('s3://b/*')) t",
        )
        .unwrap();
        let p = plan(&q).unwrap();
        assert_eq!(p.stage_count(), 2);
        assert_eq!(p.root().kind, StageKind::Aggregate);
    }

    #[test]
    fn join_promotes_kind_and_both_sides_become_dependencies() {
        let q = Query::parse(
            "SELECT * FROM READ_PARQUET('s3://a/*') x JOIN READ_PARQUET('s3://b/*') y ON x.id = y.id",
        )
        .unwrap();
        let p = plan(&q).unwrap();
        assert_eq!(p.root().kind, StageKind::Join);
        assert_eq!(p.root().dependencies.len(), 2);
        assert_eq!(p.stage_count(), 3);

        for dep_id in &p.root().dependencies {
            let scan = p.get(dep_id).unwrap();
            let binding = scan.scan.as_ref().unwrap();
            assert!(
                !binding.table_expr.contains(" AS "),
                "table_expr `{}` should exclude the alias",
                binding.table_expr
            );
        }
    }

    #[test]
    fn aliased_leaf_scan_keeps_the_alias_out_of_table_expr() {
        let q = Query::parse("SELECT t.a FROM READ_PARQUET('s3://b/*') t WHERE t.a > 5").unwrap();
        let p = plan(&q).unwrap();
        assert_eq!(p.stage_count(), 1);
        let binding = p.root().scan.as_ref().unwrap();
        assert!(!binding.table_expr.contains(" AS "));
        assert!(binding.table_expr.contains("READ_PARQUET"));
    }

    #[test]
    fn top_level_union_is_rejected() {
        let q = Query::parse(
            "SELECT a FROM READ_PARQUET('s3://b/*') UNION SELECT a FROM READ_PARQUET('s3://c/*')",
        )
        .unwrap();
        assert!(matches!(plan(&q), Err(FlockError::UnsupportedDialect(_))));
    }

    #[test]
    fn multi_from_is_rejected() {
        let q = Query::parse(
            "SELECT * FROM READ_PARQUET('s3://a/*'), READ_PARQUET('s3://b/*')",
        )
        .unwrap();
        assert!(matches!(plan(&q), Err(FlockError::UnsupportedDialect(_))));
    }

    #[test]
    fn topological_order_places_dependencies_before_dependents() {
        let q = Query::parse(
            "WITH x AS (SELECT a FROM READ_PARQUET('s3://b/*')) SELECT COUNT(*) FROM x",
        )
        .unwrap();
        let p = plan(&q).unwrap();
        let order = p.topological_order().unwrap();
        let scan_pos = order.iter().position(|id| id == &p.root().dependencies[0]).unwrap();
        let root_pos = order.iter().position(|id| id == &p.root_id).unwrap();
        assert!(scan_pos < root_pos);
    }
}
