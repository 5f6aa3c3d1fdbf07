//! # Operation Classifier & Dispatcher
//!
//! A normalized query is either composed over another query's result
//! (`from` is a query), runs over rows already in memory, or is sent to a
//! table's container. For document tables the query's shape is matched
//! against one ordered predicate table; exactly one row may match.

use crate::engine::Engine;
use crate::list::ListContainer;
use crate::normalize::TableSchema;
use fq_core::{Filter, Query, QueryError, ResultContainer, Source};
use fq_store::Version;
use futures_util::future::{BoxFuture, FutureExt};

/// The backend request shape a query is answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Set query crossing nested-document boundaries.
    Deep,
    Aggs,
    Set,
    /// Set query in the `fields`-only form of `0.x` stores.
    LegacySet,
}

/// The observations the predicates are written over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facts {
    pub modern: bool,
    pub aggregating: bool,
    pub nested: bool,
}

impl Facts {
    pub fn of(query: &Query, schema: &TableSchema<'_>, version: Version) -> Self {
        let view = schema.table.contains('.');
        let nested_field = query
            .fields()
            .into_iter()
            .filter_map(|f| schema.column(f))
            .any(|c| !c.nested_path.is_empty());
        Self {
            modern: !version.is_legacy(),
            aggregating: query.is_aggregating(),
            nested: view || nested_field || has_nested_filter(&query.filter),
        }
    }
}

fn has_nested_filter(filter: &Filter) -> bool {
    match filter {
        Filter::Nested { .. } => true,
        Filter::And(terms) | Filter::Or(terms) => terms.iter().any(has_nested_filter),
        Filter::Not(inner) => has_nested_filter(inner),
        _ => false,
    }
}

fn is_deep(f: &Facts) -> bool {
    f.modern && !f.aggregating && f.nested
}

fn is_aggs(f: &Facts) -> bool {
    f.modern && f.aggregating
}

fn is_set(f: &Facts) -> bool {
    f.modern && !f.aggregating && !f.nested
}

fn is_legacy_set(f: &Facts) -> bool {
    !f.modern && !f.aggregating && !f.nested
}

/// Tried in order.
pub const PREDICATES: &[(Shape, fn(&Facts) -> bool)] = &[
    (Shape::Deep, is_deep),
    (Shape::Aggs, is_aggs),
    (Shape::Set, is_set),
    (Shape::LegacySet, is_legacy_set),
];

pub fn classify(facts: Facts) -> Result<Shape, QueryError> {
    let mut matched = PREDICATES
        .iter()
        .filter(|(_, holds)| holds(&facts))
        .map(|(shape, _)| *shape);
    match (matched.next(), matched.next()) {
        (Some(shape), None) => Ok(shape),
        (None, _) => Err(QueryError::UnhandledQueryShape(format!(
            "no strategy for {facts:?}"
        ))),
        (Some(first), Some(second)) => Err(QueryError::UnhandledQueryShape(format!(
            "{facts:?} matches both {first:?} and {second:?}"
        ))),
    }
}

/// Run a normalized query. A query-valued `from` runs first and its rows
/// become the source of the outer query.
pub fn execute<'a>(engine: &'a Engine, mut query: Query) -> BoxFuture<'a, Result<ResultContainer, QueryError>> {
    async move {
        match std::mem::replace(&mut query.from, Source::Rows(Vec::new())) {
            Source::Query(inner) => {
                let inner = execute(engine, *inner).await?;
                query.from = Source::Rows(inner.rows);
                execute(engine, query).await
            }
            Source::Rows(rows) => ListContainer::new(rows).query(&query),
            Source::Table(name) => {
                query.from = Source::Table(name.clone());
                engine.container(&name).await?.execute(&query).await
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fq_core::Column;
    use serde_json::json;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("t", "a", "string", vec![]),
            Column::new("t", "f.sub", "long", vec!["f".into()]),
        ]
    }

    fn shape(q: serde_json::Value, table: &str, version: Version) -> Result<Shape, QueryError> {
        let columns = columns();
        let schema = TableSchema::new(table, &columns);
        let query = Query::from_json(&q).unwrap();
        classify(Facts::of(&query, &schema, version))
    }

    #[test]
    fn test_each_shape_is_reachable() {
        let modern = Version::new(1, 7);
        let legacy = Version::new(0, 90);
        assert_eq!(shape(json!({"from": "t", "select": ["a"]}), "t", modern).unwrap(), Shape::Set);
        assert_eq!(shape(json!({"from": "t", "select": ["f.sub"]}), "t", modern).unwrap(), Shape::Deep);
        assert_eq!(shape(json!({"from": "t.f"}), "t.f", modern).unwrap(), Shape::Deep);
        assert_eq!(shape(json!({"from": "t", "edges": ["f.sub"]}), "t", modern).unwrap(), Shape::Aggs);
        assert_eq!(shape(json!({"from": "t", "select": ["a"]}), "t", legacy).unwrap(), Shape::LegacySet);
    }

    #[test]
    fn test_legacy_aggregation_is_unhandled() {
        let err = shape(json!({"from": "t", "edges": ["a"]}), "t", Version::new(0, 90)).unwrap_err();
        assert!(matches!(err, QueryError::UnhandledQueryShape(_)));
    }

    #[test]
    fn test_predicates_are_exclusive() {
        for modern in [true, false] {
            for aggregating in [true, false] {
                for nested in [true, false] {
                    let facts = Facts {
                        modern,
                        aggregating,
                        nested,
                    };
                    let hits = PREDICATES.iter().filter(|(_, p)| p(&facts)).count();
                    assert!(hits <= 1, "{facts:?} matched {hits} predicates");
                    assert_eq!(hits == 1, classify(facts).is_ok());
                }
            }
        }
    }

    #[test]
    fn test_nested_filter_counts_as_nested() {
        let s = shape(
            json!({"from": "t", "where": {"nested": {"path": "f", "filter": {"eq": {"f.sub": 1}}}}}),
            "t",
            Version::new(1, 7),
        );
        assert_eq!(s.unwrap(), Shape::Deep);
    }
}
