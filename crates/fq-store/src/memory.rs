//! # In-Memory Backend
//!
//! A [`Backend`] that keeps indices, documents and statistics in process.
//! It evaluates the same request shapes the HTTP cluster does (filtered
//! queries, `terms`/`nested`/`reverse_nested`/metric aggregations, bulk
//! `doc` and `script` updates), counts every call, and can be told to fail.

use super::{
    root_table, Backend, BulkItem, ClusterMetadata, IndexMetadata, Schema, StoreError, Version,
};
use fq_core::path::{compare_values, lookup, value_to_f64, value_to_string, values_at, with_element};
use fq_core::{Column, ColumnStats, Filter};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use tokio::sync::RwLock;

const DEFAULT_SIZE: u64 = 10;

struct Document {
    id: String,
    source: Value,
}

struct Index {
    name: String,
    created: i64,
    aliases: Vec<String>,
    properties: Map<String, Value>,
    routing_path: Option<String>,
    documents: Vec<Document>,
    stats: Option<HashMap<String, ColumnStats>>,
}

#[derive(Default)]
struct State {
    indices: Vec<Index>,
    search_failure: Option<String>,
    failing_ids: HashSet<String>,
}

impl State {
    /// Resolve a table by index name, then by alias (newest index wins).
    fn index(&self, table: &str) -> Result<&Index, StoreError> {
        let name = root_table(table);
        self.indices
            .iter()
            .find(|i| i.name == name)
            .or_else(|| {
                self.indices
                    .iter()
                    .filter(|i| i.aliases.iter().any(|a| a == name))
                    .max_by_key(|i| i.created)
            })
            .ok_or_else(|| StoreError::NoSuchTable(name.to_string()))
    }

    fn index_mut(&mut self, table: &str) -> Result<&mut Index, StoreError> {
        let name = self.index(table)?.name.clone();
        self.indices
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or(StoreError::NoSuchTable(name))
    }
}

#[derive(Default)]
struct Calls {
    schema: AtomicUsize,
    cardinality: AtomicUsize,
    search: AtomicUsize,
    bulk: AtomicUsize,
    metadata: AtomicUsize,
    clear_cache: AtomicUsize,
}

/// Snapshot of how often each capability was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub schema: usize,
    pub cardinality: usize,
    pub search: usize,
    pub bulk: usize,
    pub metadata: usize,
    pub clear_cache: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.schema + self.cardinality + self.search + self.bulk + self.metadata + self.clear_cache
    }
}

pub struct MemoryBackend {
    url: String,
    version: Version,
    state: RwLock<State>,
    calls: Calls,
}

impl MemoryBackend {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            version: Version::default(),
            state: RwLock::new(State::default()),
            calls: Calls::default(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Add an index with its mapping `properties` tree.
    pub fn with_index(mut self, name: &str, created: i64, aliases: &[&str], properties: Value) -> Self {
        self.state.get_mut().indices.push(Index {
            name: name.to_string(),
            created,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            routing_path: None,
            documents: Vec::new(),
            stats: None,
        });
        self
    }

    pub fn with_routing(mut self, index: &str, path: &str) -> Self {
        if let Ok(i) = self.state.get_mut().index_mut(index) {
            i.routing_path = Some(path.to_string());
        }
        self
    }

    pub fn with_documents(mut self, index: &str, documents: Vec<(&str, Value)>) -> Self {
        if let Ok(i) = self.state.get_mut().index_mut(index) {
            i.documents.extend(documents.into_iter().map(|(id, source)| Document {
                id: id.to_string(),
                source,
            }));
        }
        self
    }

    /// Report exactly these statistics for `index` instead of computing
    /// them from its documents. Columns left out have no statistics.
    pub fn with_stats(mut self, index: &str, stats: Vec<(&str, ColumnStats)>) -> Self {
        if let Ok(i) = self.state.get_mut().index_mut(index) {
            i.stats = Some(stats.into_iter().map(|(k, v)| (k.to_string(), v)).collect());
        }
        self
    }

    /// Every search fails with a 500 carrying `message`.
    pub async fn fail_searches_with(&self, message: &str) {
        self.state.write().await.search_failure = Some(message.to_string());
    }

    /// Bulk updates of these document ids fail with a 409.
    pub async fn fail_updates_for(&self, ids: &[&str]) {
        let mut state = self.state.write().await;
        state.failing_ids.extend(ids.iter().map(|id| id.to_string()));
    }

    pub async fn set_stats(&self, index: &str, stats: Vec<(&str, ColumnStats)>) {
        let mut state = self.state.write().await;
        if let Ok(i) = state.index_mut(index) {
            i.stats = Some(stats.into_iter().map(|(k, v)| (k.to_string(), v)).collect());
        }
    }

    pub async fn document(&self, index: &str, id: &str) -> Option<Value> {
        let state = self.state.read().await;
        let index = state.index(index).ok()?;
        index
            .documents
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.source.clone())
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            schema: self.calls.schema.load(Ordering::Relaxed),
            cardinality: self.calls.cardinality.load(Ordering::Relaxed),
            search: self.calls.search.load(Ordering::Relaxed),
            bulk: self.calls.bulk.load(Ordering::Relaxed),
            metadata: self.calls.metadata.load(Ordering::Relaxed),
            clear_cache: self.calls.clear_cache.load(Ordering::Relaxed),
        }
    }

    pub fn reset_calls(&self) {
        for counter in [
            &self.calls.schema,
            &self.calls.cardinality,
            &self.calls.search,
            &self.calls.bulk,
            &self.calls.metadata,
            &self.calls.clear_cache,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    fn identity(&self, table: &str) -> String {
        format!("{}/{}", self.url, root_table(table))
    }

    fn version(&self) -> Version {
        self.version
    }

    async fn get_schema(&self, table: &str) -> Result<Schema, StoreError> {
        self.calls.schema.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().await;
        let index = state.index(table)?;
        Ok(Schema {
            properties: index.properties.clone(),
            routing_path: index.routing_path.clone(),
        })
    }

    async fn get_cardinality(
        &self,
        table: &str,
        columns: &[Column],
    ) -> Result<HashMap<String, ColumnStats>, StoreError> {
        self.calls.cardinality.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().await;
        let index = state.index(table)?;

        if let Some(stats) = &index.stats {
            return Ok(columns
                .iter()
                .filter_map(|c| stats.get(&c.name).map(|s| (c.name.clone(), s.clone())))
                .collect());
        }

        let mut out = HashMap::new();
        for c in columns.iter().filter(|c| !c.is_structural()) {
            let mut partitions: Vec<Value> = Vec::new();
            for doc in &index.documents {
                for v in values_at(&doc.source, &c.name) {
                    if !partitions.contains(v) {
                        partitions.push(v.clone());
                    }
                }
            }
            if partitions.is_empty() {
                continue;
            }
            partitions.sort_by(compare_values);
            out.insert(
                c.name.clone(),
                ColumnStats {
                    count: partitions.len() as u64,
                    partitions,
                },
            );
        }
        Ok(out)
    }

    async fn search(&self, table: &str, request: &Value) -> Result<Value, StoreError> {
        self.calls.search.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().await;
        if let Some(message) = &state.search_failure {
            return Err(StoreError::Status {
                status: 500,
                body: message.clone(),
            });
        }
        let index = state.index(table)?;
        let filter = request_filter(request)?;

        let mut matched: Vec<&Document> = index
            .documents
            .iter()
            .filter(|d| filter.eval(&d.source))
            .collect();
        sort_documents(&mut matched, &request["sort"]);

        let size = request["size"].as_u64().unwrap_or(DEFAULT_SIZE) as usize;
        let hits: Vec<Value> = matched
            .iter()
            .take(size)
            .map(|d| hit(&index.name, d, request))
            .collect();

        let mut response = json!({"hits": {"total": matched.len(), "hits": hits}});
        if let Some(aggs) = request.get("aggs").and_then(Value::as_object) {
            let docs: Vec<Value> = matched.iter().map(|d| d.source.clone()).collect();
            response["aggregations"] = Value::Object(eval_aggs(aggs, &docs)?);
        }
        Ok(response)
    }

    async fn bulk(&self, table: &str, actions: &[Value]) -> Result<Vec<BulkItem>, StoreError> {
        self.calls.bulk.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;
        let failing = state.failing_ids.clone();
        let index = state.index_mut(table)?;

        let mut items = Vec::with_capacity(actions.len() / 2);
        for pair in actions.chunks(2) {
            let [header, body] = pair else {
                return Err(StoreError::Status {
                    status: 400,
                    body: "bulk action without source line".into(),
                });
            };
            let id = value_to_string(&header["update"]["_id"]);
            if failing.contains(&id) {
                items.push(BulkItem {
                    id,
                    status: 409,
                    error: Some("VersionConflictEngineException".into()),
                });
                continue;
            }
            let Some(doc) = index.documents.iter_mut().find(|d| d.id == id) else {
                items.push(BulkItem {
                    id,
                    status: 404,
                    error: Some("DocumentMissingException".into()),
                });
                continue;
            };
            match apply_update(&mut doc.source, body) {
                Ok(()) => items.push(BulkItem {
                    id,
                    status: 200,
                    error: None,
                }),
                Err(reason) => items.push(BulkItem {
                    id,
                    status: 400,
                    error: Some(reason),
                }),
            }
        }
        Ok(items)
    }

    async fn get_cluster_metadata(&self) -> Result<ClusterMetadata, StoreError> {
        self.calls.metadata.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().await;
        Ok(ClusterMetadata {
            indices: state
                .indices
                .iter()
                .map(|i| IndexMetadata {
                    name: i.name.clone(),
                    aliases: i.aliases.clone(),
                    created: i.created,
                    mappings: vec![("doc".to_string(), i.properties.clone())],
                })
                .collect(),
        })
    }

    async fn clear_cache(&self) -> Result<(), StoreError> {
        self.calls.clear_cache.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// =============================================================================
// Request evaluation
// =============================================================================

fn bad_request(message: impl std::fmt::Display) -> StoreError {
    StoreError::Status {
        status: 400,
        body: message.to_string(),
    }
}

fn request_filter(request: &Value) -> Result<Filter, StoreError> {
    let raw = request
        .pointer("/query/filtered/filter")
        .or_else(|| request.get("filter"))
        .or_else(|| request.get("query").filter(|q| q.get("filtered").is_none()))
        .unwrap_or(&Value::Null);
    Filter::parse(raw).map_err(bad_request)
}

fn sort_documents(docs: &mut [&Document], sort: &Value) {
    let Some(terms) = sort.as_array() else {
        return;
    };
    let keys: Vec<(String, bool)> = terms
        .iter()
        .filter_map(|t| match t {
            Value::String(f) => Some((f.clone(), false)),
            Value::Object(m) => m.iter().next().map(|(f, o)| {
                let order = o.get("order").unwrap_or(o);
                (f.clone(), order.as_str() == Some("desc"))
            }),
            _ => None,
        })
        .collect();
    docs.sort_by(|a, b| {
        for (field, desc) in &keys {
            let ord = compare_values(&lookup(&a.source, field), &lookup(&b.source, field));
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn hit(index: &str, doc: &Document, request: &Value) -> Value {
    let mut hit = json!({"_index": index, "_id": doc.id});
    if request["_source"] != Value::Bool(false) {
        hit["_source"] = doc.source.clone();
    }
    if let Some(fields) = request["fields"].as_array() {
        let mut out = Map::new();
        for f in fields.iter().filter_map(Value::as_str) {
            let found: Vec<Value> = values_at(&doc.source, f).into_iter().cloned().collect();
            if !found.is_empty() {
                out.insert(f.to_string(), Value::Array(found));
            }
        }
        hit["fields"] = Value::Object(out);
    }
    hit
}

fn eval_aggs(aggs: &Map<String, Value>, docs: &[Value]) -> Result<Map<String, Value>, StoreError> {
    let mut out = Map::new();
    for (name, spec) in aggs {
        let sub = spec
            .get("aggs")
            .or_else(|| spec.get("aggregations"))
            .and_then(Value::as_object);
        let result = if let Some(terms) = spec.get("terms") {
            let field = terms["field"].as_str().ok_or_else(|| bad_request("terms without field"))?;
            let size = terms["size"].as_u64().unwrap_or(DEFAULT_SIZE) as usize;
            let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
            for doc in docs {
                let mut seen: Vec<&Value> = Vec::new();
                for key in values_at(doc, field) {
                    if seen.contains(&key) {
                        continue;
                    }
                    seen.push(key);
                    match groups.iter_mut().find(|(k, _)| k == key) {
                        Some((_, members)) => members.push(doc.clone()),
                        None => groups.push((key.clone(), vec![doc.clone()])),
                    }
                }
            }
            groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
            groups.truncate(size);
            let buckets = groups
                .iter()
                .map(|(key, members)| {
                    let mut bucket = match sub {
                        Some(sub) => eval_aggs(sub, members)?,
                        None => Map::new(),
                    };
                    bucket.insert("key".into(), key.clone());
                    bucket.insert("doc_count".into(), json!(members.len()));
                    Ok::<_, StoreError>(Value::Object(bucket))
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            json!({ "buckets": buckets })
        } else if let Some(nested) = spec.get("nested") {
            let path = nested["path"].as_str().ok_or_else(|| bad_request("nested without path"))?;
            let scoped: Vec<Value> = docs
                .iter()
                .flat_map(|doc| {
                    values_at(doc, path)
                        .into_iter()
                        .map(|element| with_element(doc, path, element))
                        .collect::<Vec<_>>()
                })
                .collect();
            scoped_result(sub, &scoped)?
        } else if spec.get("reverse_nested").is_some() {
            // Scoped documents still carry their parent's fields.
            scoped_result(sub, docs)?
        } else if let Some(filter) = spec.get("filter") {
            let filter = Filter::parse(filter).map_err(bad_request)?;
            let kept: Vec<Value> = docs.iter().filter(|d| filter.eval(d)).cloned().collect();
            scoped_result(sub, &kept)?
        } else {
            metric(spec, docs)?
        };
        out.insert(name.clone(), result);
    }
    Ok(out)
}

fn scoped_result(sub: Option<&Map<String, Value>>, docs: &[Value]) -> Result<Value, StoreError> {
    let mut result = match sub {
        Some(sub) => eval_aggs(sub, docs)?,
        None => Map::new(),
    };
    result.insert("doc_count".into(), json!(docs.len()));
    Ok(Value::Object(result))
}

fn metric(spec: &Value, docs: &[Value]) -> Result<Value, StoreError> {
    let (kind, args) = spec
        .as_object()
        .and_then(|m| m.iter().next())
        .ok_or_else(|| bad_request(format!("empty aggregation {spec}")))?;

    if kind == "top_hits" {
        let size = args["size"].as_u64().unwrap_or(3) as usize;
        let hits: Vec<Value> = docs
            .iter()
            .take(size)
            .map(|d| json!({"_source": d}))
            .collect();
        return Ok(json!({"hits": {"total": docs.len(), "hits": hits}}));
    }

    let field = args["field"].as_str().ok_or_else(|| bad_request("metric without field"))?;
    let values: Vec<&Value> = docs.iter().flat_map(|d| values_at(d, field)).collect();
    let numbers: Vec<f64> = values.iter().filter_map(|v| value_to_f64(v)).collect();
    let sum: f64 = numbers.iter().sum();
    let min = numbers.iter().cloned().fold(None, |m: Option<f64>, x| Some(m.map_or(x, |m| m.min(x))));
    let max = numbers.iter().cloned().fold(None, |m: Option<f64>, x| Some(m.map_or(x, |m| m.max(x))));
    let avg = (!numbers.is_empty()).then(|| sum / numbers.len() as f64);

    Ok(match kind.as_str() {
        "value_count" => json!({"value": values.len()}),
        "sum" => json!({"value": sum}),
        "min" => json!({"value": min}),
        "max" => json!({"value": max}),
        "avg" => json!({"value": avg}),
        "cardinality" => {
            let distinct: HashSet<String> = values.iter().map(|v| value_to_string(v)).collect();
            json!({"value": distinct.len()})
        }
        "stats" => json!({"count": numbers.len(), "min": min, "max": max, "avg": avg, "sum": sum}),
        other => return Err(bad_request(format!("unknown aggregation `{other}`"))),
    })
}

fn script_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^ctx\._source\.([\w.$-]+)\s*=\s*(.+?);?$").expect("valid update script regex")
    })
}

fn apply_update(source: &mut Value, body: &Value) -> Result<(), String> {
    if let Some(doc) = body.get("doc").and_then(Value::as_object) {
        let target = source.as_object_mut().ok_or("document is not an object")?;
        for (k, v) in doc {
            target.insert(k.clone(), v.clone());
        }
        return Ok(());
    }
    let script = body
        .get("script")
        .and_then(Value::as_str)
        .ok_or("update needs `doc` or `script`")?;
    let captures = script_pattern()
        .captures(script.trim())
        .ok_or_else(|| format!("can not run script `{script}`"))?;
    let value: Value = serde_json::from_str(&captures[2])
        .map_err(|e| format!("can not parse script value: {e}"))?;
    set_path(source, &captures[1], value);
    Ok(())
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut cursor = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        if i + 1 == segments.len() {
            map.insert((*segment).to_string(), value);
            return;
        }
        cursor = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new("mem://a")
            .with_index(
                "unittest",
                1,
                &["tests"],
                json!({"ok": {"type": "boolean"}, "platform": {"type": "string"}}),
            )
            .with_documents(
                "unittest",
                vec![
                    ("1", json!({"ok": true, "platform": "linux", "duration": 2})),
                    ("2", json!({"ok": false, "platform": "win", "duration": 4})),
                    ("3", json!({"ok": true, "platform": "linux", "duration": 6})),
                ],
            )
    }

    #[tokio::test]
    async fn test_search_filters_and_counts_calls() {
        let backend = backend();
        let response = backend
            .search(
                "tests",
                &json!({"query": {"filtered": {"filter": {"term": {"ok": true}}}}, "size": 10}),
            )
            .await
            .unwrap();
        assert_eq!(response["hits"]["total"], 2);
        assert_eq!(backend.calls().search, 1);
    }

    #[tokio::test]
    async fn test_terms_aggregation_with_metric() {
        let backend = backend();
        let response = backend
            .search(
                "unittest",
                &json!({"size": 0, "aggs": {"p": {
                    "terms": {"field": "platform"},
                    "aggs": {"d": {"sum": {"field": "duration"}}}
                }}}),
            )
            .await
            .unwrap();
        let buckets = response["aggregations"]["p"]["buckets"].as_array().unwrap();
        assert_eq!(buckets[0]["key"], "linux");
        assert_eq!(buckets[0]["doc_count"], 2);
        assert_eq!(buckets[0]["d"]["value"].as_f64(), Some(8.0));
    }

    #[tokio::test]
    async fn test_bulk_script_and_failures() {
        let backend = backend();
        backend.fail_updates_for(&["2"]).await;
        let items = backend
            .bulk(
                "unittest",
                &[
                    json!({"update": {"_id": "1"}}),
                    json!({"script": "ctx._source.platform = \"mac\""}),
                    json!({"update": {"_id": "2"}}),
                    json!({"script": "ctx._source.platform = \"mac\""}),
                ],
            )
            .await
            .unwrap();
        assert!(items[0].is_success());
        assert_eq!(items[1].status, 409);
        let doc = backend.document("unittest", "1").await.unwrap();
        assert_eq!(doc["platform"], "mac");
    }

    #[tokio::test]
    async fn test_computed_stats_skip_missing_columns() {
        let backend = backend();
        let columns = vec![
            Column::new("unittest", "platform", "string", vec![]),
            Column::new("unittest", "absent", "string", vec![]),
        ];
        let stats = backend.get_cardinality("unittest", &columns).await.unwrap();
        assert_eq!(stats["platform"].count, 2);
        assert_eq!(stats["platform"].partitions, vec![json!("linux"), json!("win")]);
        assert!(!stats.contains_key("absent"));
    }
}
