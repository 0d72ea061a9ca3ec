//! View compiler.
//!
//! Turns a [`ViewSpec`] into the DDL that builds one view generation under a
//! staging name, the rename plan that publishes it, and the concurrent refresh
//! statement used by incremental runs.

pub mod query;

use surface_indexer_shared::{
    DdlPlan, DdlStatement, IndexColumn, IndexSpec, StatementKind, ViewSpec, IDENTITY_COLUMN,
};
use tracing::debug;

use crate::errors::RebuildError;

/// Suffix of the generation being built.
pub const STAGING_SUFFIX: &str = "_temp";

/// Suffix the previous generation is renamed to before it is dropped.
pub const DISCARD_SUFFIX: &str = "_old";

/// Name of the generation being built for `name`.
pub fn staging_name(name: &str) -> String {
    format!("{}{}", name, STAGING_SUFFIX)
}

/// Name the published generation of `name` is demoted to.
pub fn discard_name(name: &str) -> String {
    format!("{}{}", name, DISCARD_SUFFIX)
}

/// Name of the unique index over the identity column.
pub fn identity_index_name(view: &str) -> String {
    format!("{}_{}_idx", view, IDENTITY_COLUMN)
}

/// Render the view query with its grouping and identity column.
pub fn compile_query(spec: &ViewSpec) -> Result<String, RebuildError> {
    let mut parsed = query::parse_query(&spec.select_sql)?;
    query::apply_group_by(&mut parsed, &spec.group_by_columns)?;
    if let Some(ref source) = spec.identity_source {
        query::append_identity(&mut parsed, source)?;
    }
    Ok(parsed.to_string())
}

/// Compile the build plan of a new generation.
///
/// Statement order: drop a leftover staging relation, create and populate the
/// staging view, create the unique identity index (it must exist before the
/// view can be refreshed concurrently), create the declared indexes, grant
/// `SELECT`, analyze.
pub fn compile(spec: &ViewSpec) -> Result<DdlPlan, RebuildError> {
    let staging = staging_name(&spec.name);
    let query = compile_query(spec)?;

    let mut statements = vec![
        DdlStatement::new(
            StatementKind::DropStaging,
            format!("drop stale {}", staging),
            format!("DROP MATERIALIZED VIEW IF EXISTS {} CASCADE", staging),
        ),
        DdlStatement::new(
            StatementKind::CreateView,
            format!("create {}", staging),
            format!("CREATE MATERIALIZED VIEW {} AS {} WITH DATA", staging, query),
        ),
    ];
    let mut index_names = Vec::with_capacity(spec.index_specs.len() + 1);

    if spec.has_identity() {
        let name = identity_index_name(&spec.name);
        statements.push(DdlStatement::new(
            StatementKind::CreateIdentityIndex,
            format!("create index {}", name),
            format!(
                "CREATE UNIQUE INDEX {}{} ON {} USING BTREE ({})",
                name, STAGING_SUFFIX, staging, IDENTITY_COLUMN
            ),
        ));
        index_names.push(name);
    }

    for index in &spec.index_specs {
        statements.push(DdlStatement::new(
            StatementKind::CreateIndex,
            format!("create index {}", index.name),
            index_sql(index, &staging),
        ));
        index_names.push(index.name.clone());
    }

    for role in &spec.grant_select {
        statements.push(DdlStatement::new(
            StatementKind::Grant,
            format!("grant select to {}", role),
            format!("GRANT SELECT ON {} TO {}", staging, role),
        ));
    }

    statements.push(DdlStatement::new(
        StatementKind::Analyze,
        format!("analyze {}", staging),
        format!("ANALYZE {}", staging),
    ));

    debug!(view = %spec.name, statements = statements.len(), "Compiled view plan");

    Ok(DdlPlan {
        view: spec.name.clone(),
        staging,
        discard: discard_name(&spec.name),
        query,
        statements,
        index_names,
    })
}

fn index_sql(index: &IndexSpec, relation: &str) -> String {
    let columns = index
        .columns
        .iter()
        .map(index_column_sql)
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "CREATE {}INDEX {}{} ON {} USING {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        index.name,
        STAGING_SUFFIX,
        relation,
        index.method,
        columns
    );
    if let Some(ref predicate) = index.partial_predicate {
        sql.push_str(" WHERE ");
        sql.push_str(predicate);
    }
    sql
}

fn index_column_sql(column: &IndexColumn) -> String {
    let mut sql = column.name.clone();
    if let Some(ref opclass) = column.opclass {
        sql.push(' ');
        sql.push_str(opclass);
    }
    if let Some(order) = column.order {
        sql.push(' ');
        sql.push_str(&order.as_str().to_uppercase());
    }
    if let Some(nulls) = column.nulls {
        sql.push_str(match nulls {
            surface_indexer_shared::NullsOrder::First => " NULLS FIRST",
            surface_indexer_shared::NullsOrder::Last => " NULLS LAST",
        });
    }
    sql
}

/// Compile the rename plan that publishes a built generation.
///
/// The plan runs in one transaction: a leftover discard generation is dropped,
/// the published view and its indexes (`published_indexes`, read from the
/// catalog) move to their discard names, and the staging view and its indexes
/// take the public names.
pub fn compile_swap(
    plan: &DdlPlan,
    published_exists: bool,
    published_indexes: &[String],
) -> Vec<DdlStatement> {
    let mut statements = vec![DdlStatement::new(
        StatementKind::DropDiscard,
        format!("drop stale {}", plan.discard),
        format!("DROP MATERIALIZED VIEW IF EXISTS {} CASCADE", plan.discard),
    )];

    if published_exists {
        statements.push(DdlStatement::new(
            StatementKind::Rename,
            format!("demote {}", plan.view),
            format!(
                "ALTER MATERIALIZED VIEW {} RENAME TO {}",
                plan.view, plan.discard
            ),
        ));
        for index in published_indexes {
            statements.push(DdlStatement::new(
                StatementKind::Rename,
                format!("demote index {}", index),
                format!("ALTER INDEX {} RENAME TO {}{}", index, index, DISCARD_SUFFIX),
            ));
        }
    }

    statements.push(DdlStatement::new(
        StatementKind::Rename,
        format!("promote {}", plan.staging),
        format!(
            "ALTER MATERIALIZED VIEW {} RENAME TO {}",
            plan.staging, plan.view
        ),
    ));
    for index in &plan.index_names {
        statements.push(DdlStatement::new(
            StatementKind::Rename,
            format!("promote index {}", index),
            format!("ALTER INDEX {}{} RENAME TO {}", index, STAGING_SUFFIX, index),
        ));
    }
    statements
}

/// Statement refreshing the published view without blocking readers.
///
/// Only views with an identity column have the unique index a concurrent
/// refresh requires.
pub fn refresh_statement(spec: &ViewSpec) -> Option<DdlStatement> {
    spec.has_identity().then(|| {
        DdlStatement::new(
            StatementKind::Refresh,
            format!("refresh {}", spec.name),
            format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {}", spec.name),
        )
    })
}
