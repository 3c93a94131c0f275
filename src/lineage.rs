//! Static table-level lineage extraction from query text.
//!
//! Every record pulled from the runtime log runs through [`extract_source_tables`]
//! independently; a malformed query must never abort a batch, so the function
//! is total: any parse or analysis failure degrades to [`Lineage::ParseFailed`]
//! instead of an error.

use anyhow::{bail, Result};
use sqlparser::ast::{
    Ident, ObjectName, ObjectNamePart, Query, SetExpr, Statement, TableFactor, TableObject,
    TableWithJoins,
};
use sqlparser::dialect::{Dialect, GenericDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use std::collections::{BTreeSet, HashSet};

/// Marker stored in place of real lineage when a query cannot be analyzed.
/// The literal string is part of the sink contract; downstream consumers
/// already key on it.
pub const PARSE_FAILURE_SENTINEL: &str = "LineageRunner could not parse sql";

/// Outcome of lineage extraction for a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lineage {
    /// Distinct source tables the query reads from, dotted parts rejoined.
    Parsed(BTreeSet<String>),
    /// The query could not be parsed or analyzed; carries the reason.
    ParseFailed(String),
}

impl Lineage {
    /// Table names to persist for this query. A failed parse yields the
    /// single-element sentinel set so the failure stays visible in the sink.
    pub fn table_names(&self) -> BTreeSet<String> {
        match self {
            Lineage::Parsed(tables) => tables.clone(),
            Lineage::ParseFailed(_) => BTreeSet::from([PARSE_FAILURE_SENTINEL.to_string()]),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Lineage::Parsed(_))
    }
}

/// Extract the set of source tables read by `sql`.
///
/// The text is parsed strictly under the Postgres dialect first; if that
/// fails, one retry runs under the permissive generic dialect. If both parses
/// fail, or the statement walker meets a construct it does not understand,
/// the result is [`Lineage::ParseFailed`].
pub fn extract_source_tables(sql: &str) -> Lineage {
    let primary = match parse_and_collect(&PostgreSqlDialect {}, sql) {
        Ok(tables) => return Lineage::Parsed(tables),
        Err(e) => e,
    };

    match parse_and_collect(&GenericDialect {}, sql) {
        Ok(tables) => Lineage::Parsed(tables),
        Err(fallback) => {
            tracing::warn!("Could not extract lineage: {primary}; fallback: {fallback}");
            Lineage::ParseFailed(primary.to_string())
        }
    }
}

fn parse_and_collect(dialect: &dyn Dialect, sql: &str) -> Result<BTreeSet<String>> {
    let statements = Parser::parse_sql(dialect, sql)?;
    let mut tables = BTreeSet::new();
    for stmt in &statements {
        collect_statement(stmt, &mut tables)?;
    }
    Ok(tables)
}

fn collect_statement(stmt: &Statement, out: &mut BTreeSet<String>) -> Result<()> {
    match stmt {
        Statement::Query(query) => collect_query(query, &HashSet::new(), out),
        Statement::Insert(ins) => {
            // Only the SELECT side feeds lineage; the insert target is not a
            // source. Table-function targets have no name to resolve.
            if let TableObject::TableFunction(_) = &ins.table {
                bail!("Unsupported INSERT target: table function");
            }
            match ins.source.as_ref() {
                Some(query) => collect_query(query, &HashSet::new(), out),
                None => Ok(()),
            }
        }
        Statement::CreateTable(ct) => match ct.query.as_ref() {
            Some(query) => collect_query(query, &HashSet::new(), out),
            None => Ok(()),
        },
        Statement::CreateView { query, .. } => collect_query(query, &HashSet::new(), out),
        // Session statements and DDL without a reading side carry no lineage.
        _ => Ok(()),
    }
}

fn collect_query(query: &Query, outer_ctes: &HashSet<String>, out: &mut BTreeSet<String>) -> Result<()> {
    let mut ctes = outer_ctes.clone();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            // CTE bodies read real tables; earlier CTEs are visible to later ones.
            collect_query(&cte.query, &ctes, out)?;
            ctes.insert(ident_to_string(&cte.alias.name).to_lowercase());
        }
    }
    collect_set_expr(&query.body, &ctes, out)
}

fn collect_set_expr(body: &SetExpr, ctes: &HashSet<String>, out: &mut BTreeSet<String>) -> Result<()> {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                collect_table_with_joins(twj, ctes, out)?;
            }
            Ok(())
        }
        SetExpr::Query(query) => collect_query(query, ctes, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, ctes, out)?;
            collect_set_expr(right, ctes, out)
        }
        SetExpr::Values(_) => Ok(()),
        other => bail!("Unsupported query body: {other}"),
    }
}

fn collect_table_with_joins(
    twj: &TableWithJoins,
    ctes: &HashSet<String>,
    out: &mut BTreeSet<String>,
) -> Result<()> {
    collect_table_factor(&twj.relation, ctes, out)?;
    for join in &twj.joins {
        collect_table_factor(&join.relation, ctes, out)?;
    }
    Ok(())
}

fn collect_table_factor(
    factor: &TableFactor,
    ctes: &HashSet<String>,
    out: &mut BTreeSet<String>,
) -> Result<()> {
    match factor {
        TableFactor::Table { name, args, .. } => {
            if args.is_some() {
                bail!("Unsupported table factor: table function {name}");
            }
            let parts = object_name_parts(name)?;
            // A bare name shadowed by a CTE in scope is not a physical table.
            if parts.len() == 1 && ctes.contains(&parts[0]) {
                return Ok(());
            }
            out.insert(parts.join("."));
            Ok(())
        }
        TableFactor::Derived { subquery, .. } => collect_query(subquery, ctes, out),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, ctes, out),
        other => bail!("Unsupported table factor: {other}"),
    }
}

fn object_name_parts(name: &ObjectName) -> Result<Vec<String>> {
    let mut parts: Vec<String> = Vec::with_capacity(name.0.len());
    for part in &name.0 {
        match part {
            ObjectNamePart::Identifier(ident) => parts.push(ident_to_string(ident)),
            ObjectNamePart::Function(_) => bail!("Unsupported function in object name: {}", name),
        }
    }
    Ok(parts)
}

fn ident_to_string(ident: &Ident) -> String {
    // Trino folds unquoted identifiers to lowercase; quoted ones keep case.
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}
