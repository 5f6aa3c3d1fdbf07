//! Aggregation queries.
//!
//! Every dimension becomes a `terms` aggregation nested inside the one
//! before it (`e0`, `e1`, ...), and every select a metric (`m0`, `m1`,
//! ...) inside the innermost bucket. Whenever the nested document scope
//! changes between levels the aggregation is wrapped in `nested` or
//! `reverse_nested` steps (`n{i}_{k}` for dimensions, `w{j}_{k}` for
//! metrics). `count` of whole documents reads the bucket's `doc_count`.
//!
//! `where` terms on nested fields select parents through a nested filter,
//! and again as a `filter` step right after every `nested` step that
//! enters their path, so buckets only see the elements that match.

use super::{
    all_of, conjuncts, default_format, edge_summaries, filtered, header_for, total_hits, Context,
};
use crate::list::sort_rows;
use fq_core::domain::SET_LIMIT;
use fq_core::path::lookup;
use fq_core::{Edge, Filter, Query, QueryError, ResultContainer, Row, Select};
use serde_json::{json, Map, Value};

struct Plan<'q> {
    dims: Vec<&'q Edge>,
    /// Nested scope of each dimension's column.
    scopes: Vec<Option<String>>,
    /// Nested scope of each select's column.
    metric_scopes: Vec<Option<String>>,
    /// `where` conjuncts on nested fields, with their scope.
    nested_terms: Vec<(String, Filter)>,
}

impl<'q> Plan<'q> {
    fn new(ctx: &Context<'_>, query: &'q Query) -> Self {
        let dims: Vec<&Edge> = query.dimensions().collect();
        let scopes: Vec<Option<String>> = dims.iter().map(|e| ctx.nested_path(&e.value)).collect();
        let leaf = scopes.last().cloned().flatten();
        let metric_scopes = query
            .select
            .iter()
            .map(|s| {
                if s.value == "." {
                    leaf.clone()
                } else {
                    ctx.nested_path(&s.value)
                }
            })
            .collect();
        let nested_terms = conjuncts(&query.filter)
            .into_iter()
            .filter_map(|term| ctx.filter_scope(&term).map(|path| (path, term)))
            .collect();
        Self {
            dims,
            scopes,
            metric_scopes,
            nested_terms,
        }
    }

    /// What an element at `path` must satisfy: terms scoped to `path` as
    /// they are, deeper ones through their own nested filter.
    fn element_filter(&self, path: &str) -> Option<Filter> {
        let deeper = format!("{path}.");
        let terms: Vec<Filter> = self
            .nested_terms
            .iter()
            .filter_map(|(scope, term)| match term {
                Filter::Nested { path: p, filter } if p == path => Some((**filter).clone()),
                _ if scope == path => Some(term.clone()),
                Filter::Nested { .. } if scope.starts_with(&deeper) => Some(term.clone()),
                _ if scope.starts_with(&deeper) => Some(Filter::Nested {
                    path: scope.clone(),
                    filter: Box::new(term.clone()),
                }),
                _ => None,
            })
            .collect();
        (!terms.is_empty()).then(|| all_of(terms))
    }

    /// Steps from nested scope `from` to `to`, each `nested` step
    /// followed by the filter of the elements it enters.
    fn steps(&self, from: Option<&str>, to: Option<&str>) -> Vec<Value> {
        let mut steps = Vec::new();
        for step in transition(from, to) {
            let entered = step["nested"]["path"].as_str().map(str::to_string);
            steps.push(step);
            if let Some(filter) = entered.and_then(|p| self.element_filter(&p)) {
                steps.push(json!({"filter": filter.to_es()}));
            }
        }
        steps
    }

    fn scope_before(&self, i: usize) -> Option<&str> {
        if i == 0 {
            None
        } else {
            self.scopes[i - 1].as_deref()
        }
    }

    fn leaf_scope(&self) -> Option<&str> {
        self.scopes.last().and_then(|s| s.as_deref())
    }
}

/// Steps that move an aggregation from nested scope `from` to `to`.
fn transition(from: Option<&str>, to: Option<&str>) -> Vec<Value> {
    match (from, to) {
        (a, b) if a == b => Vec::new(),
        (None, Some(p)) => vec![json!({"nested": {"path": p}})],
        (Some(f), Some(p)) if p.starts_with(&format!("{f}.")) => {
            vec![json!({"nested": {"path": p}})]
        }
        (Some(f), Some(p)) if f.starts_with(&format!("{p}.")) => {
            vec![json!({"reverse_nested": {"path": p}})]
        }
        (_, None) => vec![json!({"reverse_nested": {}})],
        (_, Some(p)) => vec![json!({"reverse_nested": {}}), json!({"nested": {"path": p}})],
    }
}

fn scoped(prefix: &str, steps: &[Value], aggs: Map<String, Value>) -> Map<String, Value> {
    let mut current = aggs;
    for (k, step) in steps.iter().enumerate().rev() {
        let mut node = step.as_object().cloned().unwrap_or_default();
        node.insert("aggs".into(), Value::Object(current));
        current = Map::new();
        current.insert(format!("{prefix}_{k}"), Value::Object(node));
    }
    current
}

fn descend<'v>(node: &'v Value, prefix: &str, steps: usize) -> &'v Value {
    (0..steps).fold(node, |n, k| &n[format!("{prefix}_{k}")])
}

fn metric(select: &Select) -> Option<Value> {
    match select.aggregate.as_str() {
        "count" if select.value == "." => None,
        "count" => Some(json!({"value_count": {"field": select.value}})),
        "sum" | "min" | "max" | "avg" | "cardinality" | "stats" => {
            Some(json!({ select.aggregate.as_str(): {"field": select.value} }))
        }
        _ => Some(json!({"top_hits": {"size": 1}})),
    }
}

pub fn build_request(ctx: &Context<'_>, query: &Query) -> Value {
    let plan = Plan::new(ctx, query);

    let mut level = Map::new();
    for (j, select) in query.select.iter().enumerate() {
        let Some(agg) = metric(select) else {
            continue;
        };
        let mut named = Map::new();
        named.insert(format!("m{j}"), agg);
        let steps = plan.steps(plan.leaf_scope(), plan.metric_scopes[j].as_deref());
        level.extend(scoped(&format!("w{j}"), &steps, named));
    }

    for i in (0..plan.dims.len()).rev() {
        let mut terms = json!({"terms": {"field": plan.dims[i].value, "size": SET_LIMIT}});
        if !level.is_empty() {
            terms["aggs"] = Value::Object(level);
        }
        let mut named = Map::new();
        named.insert(format!("e{i}"), terms);
        let steps = plan.steps(plan.scope_before(i), plan.scopes[i].as_deref());
        level = scoped(&format!("n{i}"), &steps, named);
    }

    let filter = ctx.document_filter(&query.filter);
    let mut request = json!({"query": filtered(&filter), "size": 0});
    if !level.is_empty() {
        request["aggs"] = Value::Object(level);
    }
    request
}

pub fn decode(ctx: &Context<'_>, query: &Query, response: &Value) -> Vec<Row> {
    let plan = Plan::new(ctx, query);
    let mut rows = Vec::new();
    walk(
        &plan,
        query,
        0,
        &response["aggregations"],
        total_hits(response),
        Map::new(),
        &mut rows,
    );
    rows
}

fn walk(
    plan: &Plan<'_>,
    query: &Query,
    i: usize,
    node: &Value,
    doc_count: u64,
    row: Row,
    rows: &mut Vec<Row>,
) {
    if i == plan.dims.len() {
        let mut row = row;
        for (j, select) in query.select.iter().enumerate() {
            row.insert(select.name.clone(), metric_value(plan, j, select, node, doc_count));
        }
        rows.push(row);
        return;
    }

    let steps = plan.steps(plan.scope_before(i), plan.scopes[i].as_deref()).len();
    let scope = descend(node, &format!("n{i}"), steps);
    let Some(buckets) = scope[format!("e{i}")]["buckets"].as_array() else {
        return;
    };
    for bucket in buckets {
        let mut next = row.clone();
        next.insert(plan.dims[i].name.clone(), bucket_key(bucket));
        let count = bucket["doc_count"].as_u64().unwrap_or(0);
        walk(plan, query, i + 1, bucket, count, next, rows);
    }
}

/// Boolean terms come back as `1`/`0` with a `"true"`/`"false"` string.
fn bucket_key(bucket: &Value) -> Value {
    match bucket["key_as_string"].as_str() {
        Some("true") => Value::Bool(true),
        Some("false") => Value::Bool(false),
        _ => bucket["key"].clone(),
    }
}

fn metric_value(plan: &Plan<'_>, j: usize, select: &Select, node: &Value, doc_count: u64) -> Value {
    if select.aggregate == "count" && select.value == "." {
        return json!(doc_count);
    }
    let steps = plan.steps(plan.leaf_scope(), plan.metric_scopes[j].as_deref()).len();
    let result = &descend(node, &format!("w{j}"), steps)[format!("m{j}")];
    match select.aggregate.as_str() {
        "stats" => result.clone(),
        "count" | "sum" | "min" | "max" | "avg" | "cardinality" => result["value"].clone(),
        _ => {
            let source = &result["hits"]["hits"][0]["_source"];
            if select.value == "." {
                source.clone()
            } else {
                lookup(source, &select.value)
            }
        }
    }
}

pub async fn execute(ctx: &Context<'_>, query: &Query) -> Result<ResultContainer, QueryError> {
    let response = ctx.search(&build_request(ctx, query)).await?;
    let mut rows = decode(ctx, query, &response);
    sort_rows(&mut rows, &query.sort);
    if let Some(limit) = query.limit {
        rows.truncate(limit);
    }
    let header = header_for(query, &rows);
    Ok(ResultContainer::new(header, rows, default_format(query)).with_edges(edge_summaries(query)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, TableSchema};
    use fq_core::Column;
    use fq_store::memory::MemoryBackend;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("t", "platform", "string", vec![]),
            Column::new("t", "duration", "long", vec![]),
            Column::new("t", "f.sub", "long", vec!["f".into()]),
        ]
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::new("mem://a")
            .with_index("t", 1, &[], json!({}))
            .with_documents(
                "t",
                vec![
                    ("1", json!({"platform": "linux", "duration": 2, "f": [{"sub": 1}, {"sub": 2}]})),
                    ("2", json!({"platform": "win", "duration": 4, "f": [{"sub": 1}]})),
                    ("3", json!({"platform": "linux", "duration": 6, "f": []})),
                ],
            )
    }

    fn query(q: Value) -> Query {
        normalize(Query::from_json(&q).unwrap(), None).unwrap()
    }

    #[test]
    fn test_nested_edge_is_wrapped() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let request = build_request(&ctx, &query(json!({"from": "t", "edges": ["f.sub"]})));
        assert_eq!(request["size"], json!(0));
        assert_eq!(request["aggs"]["n0_0"]["nested"]["path"], json!("f"));
        assert_eq!(request["aggs"]["n0_0"]["aggs"]["e0"]["terms"]["field"], json!("f.sub"));
    }

    #[test]
    fn test_root_metric_under_nested_edge_reverses() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let request = build_request(
            &ctx,
            &query(json!({"from": "t", "edges": ["f.sub"], "select": {"value": "duration", "aggregate": "sum"}})),
        );
        let terms = &request["aggs"]["n0_0"]["aggs"]["e0"];
        assert_eq!(terms["aggs"]["w0_0"]["reverse_nested"], json!({}));
        assert_eq!(terms["aggs"]["w0_0"]["aggs"]["m0"]["sum"]["field"], json!("duration"));
    }

    #[test]
    fn test_nested_where_scopes_query_and_buckets() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let request = build_request(
            &ctx,
            &query(json!({
                "from": "t",
                "edges": ["f.sub"],
                "where": {"and": [{"eq": {"f.sub": 2}}, {"eq": {"platform": "linux"}}]}
            })),
        );
        assert_eq!(
            request["query"]["filtered"]["filter"],
            json!({"and": [
                {"nested": {"path": "f", "filter": {"term": {"f.sub": 2}}}},
                {"term": {"platform": "linux"}}
            ]})
        );
        let scope = &request["aggs"]["n0_0"];
        assert_eq!(scope["nested"]["path"], json!("f"));
        assert_eq!(scope["aggs"]["n0_1"]["filter"], json!({"term": {"f.sub": 2}}));
        assert_eq!(scope["aggs"]["n0_1"]["aggs"]["e0"]["terms"]["field"], json!("f.sub"));
    }

    #[tokio::test]
    async fn test_nested_where_drops_failing_siblings() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let result = execute(
            &ctx,
            &query(json!({"from": "t", "groupby": ["f.sub"], "where": {"eq": {"f.sub": 2}}})),
        )
        .await
        .unwrap();
        assert_eq!(result.column("f.sub"), vec![json!(2)]);
        assert_eq!(result.column("count"), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_edges_with_metrics() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let result = execute(
            &ctx,
            &query(json!({
                "from": "t",
                "edges": ["platform"],
                "select": [{"aggregate": "count"}, {"value": "duration", "aggregate": "avg"}]
            })),
        )
        .await
        .unwrap();
        assert_eq!(result.column("platform"), vec![json!("linux"), json!("win")]);
        assert_eq!(result.column("count"), vec![json!(2), json!(1)]);
        assert_eq!(result.rows[0]["duration"].as_f64(), Some(4.0));
        assert_eq!(backend.calls().search, 1);
    }

    #[tokio::test]
    async fn test_nested_edge_counts_nested_documents() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let result = execute(&ctx, &query(json!({"from": "t", "groupby": ["f.sub"]})))
            .await
            .unwrap();
        assert_eq!(result.column("f.sub"), vec![json!(1), json!(2)]);
        assert_eq!(result.column("count"), vec![json!(2), json!(1)]);
    }

    #[tokio::test]
    async fn test_no_edges_is_one_row() {
        let backend = backend();
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let result = execute(
            &ctx,
            &query(json!({
                "from": "t",
                "select": [{"aggregate": "count"}, {"value": "duration", "aggregate": "max"}],
                "where": {"eq": {"platform": "linux"}}
            })),
        )
        .await
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows[0]["count"], json!(2));
        assert_eq!(result.rows[0]["duration"].as_f64(), Some(6.0));
    }
}
