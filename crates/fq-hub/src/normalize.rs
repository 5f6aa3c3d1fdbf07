//! # Query Normalizer
//!
//! Rewrites a parsed query against the resolved schema of its table, in a
//! fixed order:
//!
//! 1. field references resolve to absolute column names (nested views
//!    accept relative names), edges pick up their column's domain;
//! 2. typed schemas get every reference unwrapped to its `$value` column;
//! 3. aggregate names are checked against the supported set and
//!    canonicalized.
//!
//! Nothing here talks to the backend.

use crate::cache::{is_typed, TYPED_VALUE};
use fq_core::query::NO_AGGREGATE;
use fq_core::{Column, Query, QueryError, Select};

/// Aggregates the backend strategies and the in-memory container know.
pub const SUPPORTED_AGGREGATES: &[&str] = &[
    "none",
    "one",
    "count",
    "sum",
    "add",
    "min",
    "minimum",
    "max",
    "maximum",
    "avg",
    "average",
    "mean",
    "cardinality",
    "stats",
];

pub fn canonical_aggregate(name: &str) -> Option<&'static str> {
    Some(match name {
        "none" => NO_AGGREGATE,
        "one" => "one",
        "count" => "count",
        "sum" | "add" => "sum",
        "min" | "minimum" => "min",
        "max" | "maximum" => "max",
        "avg" | "average" | "mean" => "avg",
        "cardinality" => "cardinality",
        "stats" => "stats",
        _ => return None,
    })
}

/// The columns a query is normalized against.
#[derive(Debug, Clone, Copy)]
pub struct TableSchema<'a> {
    pub table: &'a str,
    pub columns: &'a [Column],
}

impl<'a> TableSchema<'a> {
    pub fn new(table: &'a str, columns: &'a [Column]) -> Self {
        Self { table, columns }
    }

    /// Column known by `name`; relative names win over absolute ones.
    fn find(&self, name: &str) -> Option<&'a Column> {
        self.columns
            .iter()
            .filter(|c| c.name == name)
            .max_by_key(|c| c.relative)
    }

    /// Column with absolute name `abs_name`.
    pub fn column(&self, abs_name: &str) -> Option<&'a Column> {
        self.columns
            .iter()
            .find(|c| c.abs_name == abs_name && !c.relative)
    }

    pub fn resolve_field(&self, field: &str) -> Result<String, QueryError> {
        if field == "." || field == "*" {
            return Ok(field.to_string());
        }
        if let Some(c) = self.find(field) {
            return Ok(c.abs_name.clone());
        }
        let prefix = format!("{field}.");
        if self.columns.iter().any(|c| c.name.starts_with(&prefix)) {
            return Ok(field.to_string());
        }
        Err(QueryError::UnknownField {
            table: self.table.to_string(),
            field: field.to_string(),
        })
    }

    fn unwrap_typed(&self, field: &str) -> String {
        let typed = format!("{field}.{TYPED_VALUE}");
        if self.column(&typed).is_some() {
            typed
        } else {
            field.to_string()
        }
    }
}

pub fn normalize(mut query: Query, schema: Option<&TableSchema<'_>>) -> Result<Query, QueryError> {
    let aggregating = query.is_aggregating();
    if aggregating && query.select.is_empty() {
        query.select.push(Select {
            name: "count".to_string(),
            value: ".".to_string(),
            aggregate: "count".to_string(),
        });
    }

    let outputs: Vec<String> = query
        .select
        .iter()
        .map(|s| s.name.clone())
        .chain(query.dimensions().map(|e| e.name.clone()))
        .collect();

    if let Some(schema) = schema {
        rewrite_fields(&mut query, &outputs, aggregating, &mut |f: &str| schema.resolve_field(f))?;
        if is_typed(schema.columns) {
            rewrite_fields(&mut query, &outputs, aggregating, &mut |f: &str| {
                Ok::<_, QueryError>(schema.unwrap_typed(f))
            })?;
        }
        for edge in query.edges.iter_mut().chain(query.groupby.iter_mut()) {
            if edge.domain.is_none() {
                edge.domain = schema.column(&edge.value).and_then(|c| c.domain.clone());
            }
        }
    }

    for select in &mut query.select {
        let canonical = canonical_aggregate(&select.aggregate).ok_or_else(|| {
            QueryError::UnsupportedAggregate {
                select: select.name.clone(),
                aggregate: select.aggregate.clone(),
            }
        })?;
        select.aggregate = canonical.to_string();
    }
    Ok(query)
}

fn rewrite_fields(
    query: &mut Query,
    outputs: &[String],
    aggregating: bool,
    rewrite: &mut impl FnMut(&str) -> Result<String, QueryError>,
) -> Result<(), QueryError> {
    for select in &mut query.select {
        select.value = rewrite(&select.value)?;
    }
    for edge in query.edges.iter_mut().chain(query.groupby.iter_mut()) {
        edge.value = rewrite(&edge.value)?;
    }
    for sort in &mut query.sort {
        // Aggregations sort their output rows.
        if aggregating && outputs.contains(&sort.field) {
            continue;
        }
        sort.field = rewrite(&sort.field)?;
    }
    query.filter = query.filter.try_map_fields(rewrite)?;
    Ok(())
}
