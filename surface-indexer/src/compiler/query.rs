//! Query analysis and rewriting with `sqlparser`.
//!
//! View queries are parsed once with the PostgreSQL dialect. The parsed query
//! gives the projected column names used to validate index declarations, and
//! is rewritten in place to carry the row identity column and the declared
//! grouping before it is rendered back to SQL.

use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, GroupByExpr, Ident, Query, SelectItem, SetExpr, Statement, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use surface_indexer_shared::IDENTITY_COLUMN;

use crate::errors::RebuildError;

/// Output columns of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Names of the output columns that can be determined statically.
    pub columns: Vec<String>,
    /// Whether the projection contains `*` or `table.*`.
    pub has_wildcard: bool,
}

impl Projection {
    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Parse a view query, requiring exactly one query statement.
pub fn parse_query(sql: &str) -> Result<Box<Query>, RebuildError> {
    let dialect = PostgreSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)?;
    if statements.len() != 1 {
        return Err(RebuildError::spec_validation(format!(
            "View SQL must contain exactly one statement, found {}",
            statements.len()
        )));
    }
    match statements.remove(0) {
        Statement::Query(query) => Ok(query),
        other => Err(RebuildError::spec_validation(format!(
            "View SQL must be a SELECT query, got: {}",
            other
        ))),
    }
}

/// Output column names of a parsed query.
pub fn projection(query: &Query) -> Projection {
    set_expr_projection(query.body.as_ref())
}

fn set_expr_projection(body: &SetExpr) -> Projection {
    match body {
        SetExpr::Select(select) => {
            let mut columns = Vec::with_capacity(select.projection.len());
            let mut has_wildcard = false;
            for item in &select.projection {
                match item {
                    SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                        columns.push(column_name(ident));
                    }
                    SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                        if let Some(last) = parts.last() {
                            columns.push(column_name(last));
                        }
                    }
                    SelectItem::UnnamedExpr(_) => {}
                    SelectItem::ExprWithAlias { alias, .. } => columns.push(column_name(alias)),
                    SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                        has_wildcard = true;
                    }
                }
            }
            Projection {
                columns,
                has_wildcard,
            }
        }
        SetExpr::Query(query) => projection(query),
        // The left branch names the columns of a set operation.
        SetExpr::SetOperation { left, .. } => set_expr_projection(left),
        _ => Projection {
            columns: Vec::new(),
            has_wildcard: true,
        },
    }
}

/// Unquoted identifiers fold to lower case in PostgreSQL.
fn column_name(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

fn is_grouped(group_by: &GroupByExpr) -> bool {
    match group_by {
        GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
        GroupByExpr::All(_) => true,
    }
}

/// Built-in PostgreSQL aggregates recognised in view projections.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "array_agg", "avg", "bit_and", "bit_or", "bool_and", "bool_or", "count", "every",
    "json_agg", "json_object_agg", "jsonb_agg", "jsonb_object_agg", "max", "min",
    "string_agg", "sum",
];

/// Finds an aggregate call in the outer projection, ignoring subqueries and
/// window functions.
#[derive(Default)]
struct AggregateFinder {
    depth: usize,
    found: Option<String>,
}

impl Visitor for AggregateFinder {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        if let Expr::Function(function) = expr {
            let name = function
                .name
                .0
                .last()
                .map(|ident| ident.value.to_lowercase());
            if let Some(name) = name {
                if function.over.is_none() && AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
                    self.found = Some(name);
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// The first aggregate a plain SELECT without `GROUP BY` projects, if any.
pub fn ungrouped_aggregate(query: &Query) -> Option<String> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    if is_grouped(&select.group_by) {
        return None;
    }
    let mut finder = AggregateFinder::default();
    let _ = select.projection.visit(&mut finder);
    finder.found
}

/// Add `GROUP BY columns` when the query does not group already.
///
/// An existing `GROUP BY` is kept as written.
pub fn apply_group_by(query: &mut Query, columns: &[String]) -> Result<(), RebuildError> {
    if columns.is_empty() {
        return Ok(());
    }
    let SetExpr::Select(select) = query.body.as_mut() else {
        return Err(RebuildError::spec_validation(
            "group_by requires a plain SELECT query",
        ));
    };
    if !is_grouped(&select.group_by) {
        select.group_by = GroupByExpr::Expressions(
            columns
                .iter()
                .map(|column| Expr::Identifier(Ident::new(column)))
                .collect(),
            Vec::new(),
        );
    }
    Ok(())
}

/// SQL computing the row identity from `source`.
///
/// Grouped rows hash their contributing identifiers sorted bytewise (ordering by
/// the UTF-8 bytes sidesteps collation rules) and joined with `,`; ungrouped
/// rows hash their single identifier. Both match `RowIdentity::from_source_ids`.
pub fn identity_expression(source: &str, grouped: bool) -> String {
    let text = format!("({})::TEXT", source);
    if grouped {
        format!(
            "encode(sha256(convert_to(array_to_string(array_agg({text} ORDER BY convert_to({text}, 'UTF8')), ','), 'UTF8')), 'hex')",
            text = text
        )
    } else {
        format!("encode(sha256(convert_to({}, 'UTF8')), 'hex')", text)
    }
}

/// Project the row identity column computed from `source`.
pub fn append_identity(query: &mut Query, source: &str) -> Result<(), RebuildError> {
    let SetExpr::Select(select) = query.body.as_mut() else {
        return Err(RebuildError::spec_validation(
            "identity_source requires a plain SELECT query",
        ));
    };

    let sql = identity_expression(source, is_grouped(&select.group_by));
    let dialect = PostgreSqlDialect {};
    let expr = Parser::new(&dialect).try_with_sql(&sql)?.parse_expr()?;

    select.projection.push(SelectItem::ExprWithAlias {
        expr,
        alias: Ident::new(IDENTITY_COLUMN),
    });
    Ok(())
}
