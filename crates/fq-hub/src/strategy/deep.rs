//! Set queries that cross nested-document boundaries.
//!
//! The backend selects parent documents whose nested elements match,
//! then every parent is expanded into one row per nested element (each
//! row still carrying its parent's fields) and the query runs over those
//! rows in memory.
//!
//! A sorted query reads every matching parent before it sorts and cuts.
//! An unsorted one asks for `limit` parents first and reads the rest only
//! when those expand to fewer than `limit` rows.

use super::{all_of, conjuncts, filtered, hits, total_hits, Context, DEFAULT_LIMIT, MAX_DOCUMENTS};
use crate::list::ListContainer;
use fq_core::path::{split_field, values_at, with_element};
use fq_core::{Filter, Query, QueryError, ResultContainer, Row};
use fq_store::root_table;
use serde_json::{json, Value};

/// The nested paths rows expand over, outermost first.
pub fn nested_chain(ctx: &Context<'_>, query: &Query) -> Result<Vec<String>, QueryError> {
    let target = view_path(ctx.schema.table)
        .or_else(|| deepest_referenced(ctx, query))
        .or_else(|| nested_filter_path(&query.filter).map(str::to_string))
        .ok_or_else(|| {
            QueryError::UnhandledQueryShape(format!(
                "no nested path to expand for query on `{}`",
                ctx.schema.table
            ))
        })?;

    let mut chain: Vec<String> = ctx
        .schema
        .columns
        .iter()
        .flat_map(|c| c.nested_path.iter())
        .filter(|p| target.starts_with(&format!("{p}.")))
        .cloned()
        .collect();
    chain.push(target);
    chain.sort_by_key(|p| split_field(p).len());
    chain.dedup();
    Ok(chain)
}

/// `repo.changes.files` is a view on `changes.files` of `repo`.
fn view_path(table: &str) -> Option<String> {
    let root = root_table(table);
    table
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

fn deepest_referenced(ctx: &Context<'_>, query: &Query) -> Option<String> {
    query
        .fields()
        .into_iter()
        .filter_map(|f| ctx.nested_path(f))
        .max_by_key(|p| split_field(p).len())
}

fn nested_filter_path(filter: &Filter) -> Option<&str> {
    match filter {
        Filter::Nested { path, .. } => Some(path),
        Filter::And(terms) | Filter::Or(terms) => terms.iter().find_map(nested_filter_path),
        Filter::Not(inner) => nested_filter_path(inner),
        _ => None,
    }
}

/// Wrap every top-level conjunct that reads under `path` in a nested
/// filter, so the backend evaluates it per element.
pub fn scope_filter(filter: &Filter, path: &str) -> Filter {
    all_of(
        conjuncts(filter)
            .into_iter()
            .map(|term| match term {
                Filter::Nested { .. } => term,
                term if term.touches(path) => Filter::Nested {
                    path: path.to_string(),
                    filter: Box::new(term),
                },
                term => term,
            })
            .collect(),
    )
}

/// Request for up to `size` parent documents.
pub fn build_request(query: &Query, chain: &[String], size: usize) -> Value {
    let filter = match chain.last() {
        Some(path) => scope_filter(&query.filter, path),
        None => query.filter.clone(),
    };
    json!({
        "query": filtered(&filter),
        "_source": true,
        "size": size,
    })
}

/// One row per innermost nested element of `source`.
pub fn expand(source: &Value, chain: &[String]) -> Vec<Row> {
    let mut docs = vec![source.clone()];
    for path in chain {
        docs = docs
            .iter()
            .flat_map(|doc| {
                values_at(doc, path)
                    .into_iter()
                    .map(|element| with_element(doc, path, element))
                    .collect::<Vec<_>>()
            })
            .collect();
    }
    docs.into_iter()
        .filter_map(|d| match d {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

pub async fn execute(ctx: &Context<'_>, query: &Query) -> Result<ResultContainer, QueryError> {
    let chain = nested_chain(ctx, query)?;
    tracing::debug!("expand {} over {:?}", ctx.schema.table, chain);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let mut local = query.clone();
    local.limit = Some(limit);

    let mut size = if query.sort.is_empty() { limit } else { MAX_DOCUMENTS };
    loop {
        let response = ctx.search(&build_request(query, &chain, size)).await?;
        let parents = hits(&response);
        let rows: Vec<Row> = parents
            .iter()
            .flat_map(|hit| expand(&hit["_source"], &chain))
            .collect();
        let result = ListContainer::new(rows).query(&local)?;

        let complete = parents.len() as u64 >= total_hits(&response);
        if result.len() >= limit || complete || size >= MAX_DOCUMENTS {
            if !complete && size >= MAX_DOCUMENTS {
                tracing::warn!(
                    "Expanded only {} of {} parents of {}",
                    parents.len(),
                    total_hits(&response),
                    ctx.schema.table
                );
            }
            return Ok(result);
        }
        size = MAX_DOCUMENTS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::nested_view;
    use crate::normalize::{normalize, TableSchema};
    use fq_core::Column;
    use fq_store::memory::MemoryBackend;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("t", "id", "string", vec![]),
            Column::new("t", "f", "nested", vec!["f".into()]),
            Column::new("t", "f.sub", "long", vec!["f".into()]),
            Column::new("t", "f.g", "nested", vec!["f.g".into(), "f".into()]),
            Column::new("t", "f.g.x", "string", vec!["f.g".into(), "f".into()]),
        ]
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::new("mem://a")
            .with_index("t", 1, &[], json!({}))
            .with_documents(
                "t",
                vec![
                    ("1", json!({"id": "a", "f": [{"sub": 1, "g": [{"x": "p"}, {"x": "q"}]}, {"sub": 2}]})),
                    ("2", json!({"id": "b", "f": [{"sub": 1}]})),
                    ("3", json!({"id": "c", "f": []})),
                ],
            )
    }

    #[test]
    fn test_filter_on_nested_field_is_scoped() {
        let filter = Filter::parse(&json!({"and": [{"eq": {"f.sub": 1}}, {"eq": {"id": "a"}}]})).unwrap();
        let scoped = scope_filter(&filter, "f");
        assert_eq!(
            scoped.to_es(),
            json!({"and": [
                {"nested": {"path": "f", "filter": {"term": {"f.sub": 1}}}},
                {"term": {"id": "a"}}
            ]})
        );
    }

    #[test]
    fn test_chain_includes_outer_paths() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let query = Query::from_json(&json!({"from": "t", "select": ["id", "f.g.x"]})).unwrap();
        assert_eq!(nested_chain(&ctx, &query).unwrap(), vec!["f", "f.g"]);

        let flat = Query::from_json(&json!({"from": "t", "select": ["id"]})).unwrap();
        assert!(matches!(
            nested_chain(&ctx, &flat),
            Err(QueryError::UnhandledQueryShape(_))
        ));
    }

    #[test]
    fn test_expand_keeps_parent_fields() {
        let rows = expand(
            &json!({"id": "a", "f": [{"sub": 1}, {"sub": 2}]}),
            &["f".to_string()],
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], json!("a"));
        assert_eq!(rows[1]["f"], json!({"sub": 2}));
    }

    #[tokio::test]
    async fn test_rows_per_matching_element() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let query = Query::from_json(&json!({
            "from": "t",
            "select": ["id", "f.sub"],
            "where": {"eq": {"f.sub": 1}}
        }))
        .unwrap();
        let result = execute(&ctx, &query).await.unwrap();
        assert_eq!(result.column("id"), vec![json!("a"), json!("b")]);
        assert_eq!(result.column("f.sub"), vec![json!(1), json!(1)]);
    }

    fn parents(documents: Vec<(&str, Value)>) -> MemoryBackend {
        MemoryBackend::new("mem://a")
            .with_index("t", 1, &[], json!({}))
            .with_documents("t", documents)
    }

    #[tokio::test]
    async fn test_sorted_limit_reads_every_parent() {
        let backend = parents(vec![
            ("1", json!({"id": "a", "f": [{"sub": 3}]})),
            ("2", json!({"id": "b", "f": [{"sub": 1}]})),
            ("3", json!({"id": "c", "f": [{"sub": 99}, {"sub": 2}]})),
        ]);
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let query = Query::from_json(&json!({
            "from": "t",
            "select": ["id", "f.sub"],
            "sort": [{"f.sub": "desc"}],
            "limit": 1
        }))
        .unwrap();
        let chain = nested_chain(&ctx, &query).unwrap();
        assert_eq!(build_request(&query, &chain, MAX_DOCUMENTS)["size"], json!(MAX_DOCUMENTS));

        let result = execute(&ctx, &query).await.unwrap();
        assert_eq!(result.column("f.sub"), vec![json!(99)]);
        assert_eq!(result.column("id"), vec![json!("c")]);
        assert_eq!(backend.calls().search, 1);
    }

    #[tokio::test]
    async fn test_short_page_reads_remaining_parents() {
        let backend = parents(vec![
            ("1", json!({"id": "a", "f": []})),
            ("2", json!({"id": "b", "f": []})),
            ("3", json!({"id": "c", "f": [{"sub": 5}]})),
        ]);
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let query = Query::from_json(&json!({"from": "t", "select": ["id", "f.sub"], "limit": 1})).unwrap();
        let result = execute(&ctx, &query).await.unwrap();
        assert_eq!(result.column("id"), vec![json!("c")]);
        assert_eq!(backend.calls().search, 2);
    }

    #[tokio::test]
    async fn test_nested_view_expands_its_path() {
        let backend = backend();
        let parent = columns();
        let view = nested_view("t.f", &parent, "f").unwrap();
        let ctx = Context::new(&backend, TableSchema::new("t.f", &view));
        let schema = TableSchema::new("t.f", &view);
        let query = normalize(
            Query::from_json(&json!({"from": "t.f", "select": ["sub", "..id"], "sort": "sub"})).unwrap(),
            Some(&schema),
        )
        .unwrap();
        let result = execute(&ctx, &query).await.unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.column("sub"), vec![json!(1), json!(1), json!(2)]);
    }
}
