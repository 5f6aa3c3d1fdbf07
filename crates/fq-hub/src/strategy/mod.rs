//! # Execution Strategies
//!
//! One module per backend request shape. Each builds the request for a
//! normalized query, sends it, and decodes the response into a
//! [`ResultContainer`]:
//!
//! - [`setop`]: flat row projection and filter;
//! - [`aggs`]: `terms` aggregations per dimension with metrics per select;
//! - [`deep`]: row expansion of nested documents;
//! - [`legacy`]: the `fields`-only set form of `0.x` stores.

pub mod aggs;
pub mod deep;
pub mod legacy;
pub mod setop;

use crate::dispatch::Shape;
use crate::normalize::TableSchema;
use fq_core::path::{lookup, split_field, unwrap_list};
use fq_core::{EdgeSummary, Filter, Format, Query, QueryError, ResultContainer, Row, Select, SortOrder};
use fq_store::{root_table, Backend};
use serde_json::{json, Map, Value};

/// Rows returned when a set query gives no `limit`.
pub const DEFAULT_LIMIT: usize = 10;

/// Most documents fetched when rows are sorted or cut after the backend
/// answers.
pub const MAX_DOCUMENTS: usize = 200_000;

pub struct Context<'a> {
    pub backend: &'a dyn Backend,
    pub schema: TableSchema<'a>,
}

impl<'a> Context<'a> {
    pub fn new(backend: &'a dyn Backend, schema: TableSchema<'a>) -> Self {
        Self { backend, schema }
    }

    /// Index the request goes to.
    pub fn index(&self) -> &'a str {
        root_table(self.schema.table)
    }

    /// Innermost nested document boundary `field` lives under.
    pub fn nested_path(&self, field: &str) -> Option<String> {
        self.schema
            .column(field)
            .and_then(|c| c.nested_path.first().cloned())
    }

    /// Innermost nested path any field of `term` lives under.
    pub fn filter_scope(&self, term: &Filter) -> Option<String> {
        if let Filter::Nested { path, .. } = term {
            return Some(path.clone());
        }
        term.fields()
            .into_iter()
            .filter_map(|f| self.nested_path(f))
            .max_by_key(|p| split_field(p).len())
    }

    /// The filter as a document-level query: every conjunct on a nested
    /// field is wrapped in a nested filter over its own path.
    pub fn document_filter(&self, filter: &Filter) -> Filter {
        all_of(
            conjuncts(filter)
                .into_iter()
                .map(|term| match self.filter_scope(&term) {
                    Some(path) if !matches!(term, Filter::Nested { .. }) => Filter::Nested {
                        path,
                        filter: Box::new(term),
                    },
                    _ => term,
                })
                .collect(),
        )
    }

    pub async fn search(&self, request: &Value) -> Result<Value, QueryError> {
        tracing::debug!("search {}: {}", self.index(), request);
        Ok(self.backend.search(self.index(), request).await?)
    }
}

pub async fn run(shape: Shape, ctx: &Context<'_>, query: &Query) -> Result<ResultContainer, QueryError> {
    match shape {
        Shape::Deep => deep::execute(ctx, query).await,
        Shape::Aggs => aggs::execute(ctx, query).await,
        Shape::Set => setop::execute(ctx, query).await,
        Shape::LegacySet => legacy::execute(ctx, query).await,
    }
}

// =============================================================================
// Request pieces
// =============================================================================

pub fn filtered(filter: &Filter) -> Value {
    json!({"filtered": {"query": {"match_all": {}}, "filter": filter.to_es()}})
}

pub fn conjuncts(filter: &Filter) -> Vec<Filter> {
    match filter {
        Filter::MatchAll => Vec::new(),
        Filter::And(terms) => terms.clone(),
        other => vec![other.clone()],
    }
}

pub fn all_of(mut terms: Vec<Filter>) -> Filter {
    match terms.len() {
        0 => Filter::MatchAll,
        1 => terms.remove(0),
        _ => Filter::And(terms),
    }
}

pub fn sort_request(query: &Query) -> Value {
    Value::Array(
        query
            .sort
            .iter()
            .map(|s| {
                let order = match s.order {
                    SortOrder::Asc => "asc",
                    SortOrder::Desc => "desc",
                };
                json!({ s.field.as_str(): {"order": order} })
            })
            .collect(),
    )
}

/// Whole-document selection: nothing listed, `*`, or `.`.
pub fn selects_documents(query: &Query) -> bool {
    query.select.is_empty() || query.select.iter().any(|s| s.is_star() || s.value == ".")
}

/// Total hit count in either the `1.x` number or the later object form.
pub fn total_hits(response: &Value) -> u64 {
    let total = &response["hits"]["total"];
    total
        .as_u64()
        .or_else(|| total["value"].as_u64())
        .unwrap_or(0)
}

pub fn hits(response: &Value) -> &[Value] {
    response["hits"]["hits"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

// =============================================================================
// Result shaping
// =============================================================================

pub fn default_format(query: &Query) -> Format {
    query.format.unwrap_or(if query.edges.is_empty() {
        Format::List
    } else {
        Format::Cube
    })
}

pub fn edge_summaries(query: &Query) -> Vec<EdgeSummary> {
    query
        .dimensions()
        .map(|e| EdgeSummary {
            name: e.name.clone(),
            partitions: e
                .domain
                .as_ref()
                .and_then(|d| d.partitions())
                .map(<[Value]>::to_vec)
                .unwrap_or_default(),
        })
        .collect()
}

/// Output columns: dimensions, then selects. A whole-document selection
/// contributes every key seen in `rows`.
pub fn header_for(query: &Query, rows: &[Row]) -> Vec<String> {
    let mut header: Vec<String> = query.dimensions().map(|e| e.name.clone()).collect();
    for select in &query.select {
        if select.is_star() {
            continue;
        }
        if !header.contains(&select.name) {
            header.push(select.name.clone());
        }
    }
    if query.select.is_empty() || query.select.iter().any(Select::is_star) {
        for row in rows {
            for key in row.keys() {
                if !header.contains(key) {
                    header.push(key.clone());
                }
            }
        }
    }
    header
}

/// One output row from a document. Values listed in `fields` (the
/// backend's stored-field answer) win over the `_source` document.
pub fn project(select: &[Select], source: &Value, fields: Option<&Value>) -> Row {
    let mut row = Map::new();
    if select.is_empty() {
        if let Some(obj) = source.as_object() {
            row.extend(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        return row;
    }
    for s in select {
        if s.is_star() {
            if let Some(obj) = source.as_object() {
                row.extend(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            continue;
        }
        let value = if s.value == "." {
            source.clone()
        } else {
            match fields.and_then(|f| f.get(&s.value)) {
                Some(stored) => unwrap_list(stored),
                None => lookup(source, &s.value),
            }
        };
        row.insert(s.name.clone(), value);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_prefers_stored_fields() {
        let select = vec![Select {
            name: "p".into(),
            value: "build.platform".into(),
            aggregate: "none".into(),
        }];
        let source = json!({"build": {"platform": "from-source"}});
        let fields = json!({"build.platform": ["stored"]});
        assert_eq!(project(&select, &source, Some(&fields))["p"], json!("stored"));
        assert_eq!(project(&select, &source, None)["p"], json!("from-source"));
    }

    #[test]
    fn test_total_hits_both_forms() {
        assert_eq!(total_hits(&json!({"hits": {"total": 3}})), 3);
        assert_eq!(total_hits(&json!({"hits": {"total": {"value": 4}}})), 4);
    }

    #[test]
    fn test_sort_request() {
        let query = Query::from_json(&json!({"from": "t", "sort": [{"a": "desc"}, "b"]})).unwrap();
        assert_eq!(
            sort_request(&query),
            json!([{"a": {"order": "desc"}}, {"b": {"order": "asc"}}])
        );
    }
}
