//! # HTTP Backend
//!
//! Speaks the REST protocol of a search-engine cluster: `_mapping` for
//! schemas, `_search` with aggregations for statistics and queries,
//! `_bulk` for updates, `_cluster/state/metadata` for the catalog.

use super::{
    root_table, Backend, BulkItem, ClusterMetadata, IndexMetadata, Schema, StoreError, Version,
};
use fq_core::domain::SET_LIMIT;
use fq_core::{Column, ColumnStats};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    version: Version,
}

impl HttpBackend {
    pub fn new(base_url: &str, version: Version, timeout: Option<Duration>) -> Result<Self, StoreError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            version,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn get(&self, path: &str) -> Result<Value, StoreError> {
        tracing::debug!("GET {}", path);
        self.send(self.client.get(self.url(path))).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        tracing::debug!("POST {}", path);
        self.send(self.client.post(self.url(path)).json(body)).await
    }
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    fn identity(&self, table: &str) -> String {
        self.url(root_table(table))
    }

    fn version(&self) -> Version {
        self.version
    }

    async fn get_schema(&self, table: &str) -> Result<Schema, StoreError> {
        let index = root_table(table);
        let response = self.get(&format!("{index}/_mapping")).await?;
        let indices = response
            .as_object()
            .ok_or_else(|| StoreError::Decode("expecting mapping object".into()))?;
        // An alias may resolve to several indices; the newest one wins.
        let settings = if indices.len() > 1 {
            self.get(&format!("{index}/_settings")).await?
        } else {
            Value::Null
        };
        let newest = newest_index(indices, &settings)
            .ok_or_else(|| StoreError::NoSuchTable(index.to_string()))?;
        let mappings = indices[newest]
            .get("mappings")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut schema = Schema::default();
        for (_, mapping) in mappings {
            if let Some(props) = mapping.get("properties").and_then(Value::as_object) {
                schema
                    .properties
                    .extend(props.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            if let Some(path) = mapping.pointer("/_routing/path").and_then(Value::as_str) {
                schema.routing_path = Some(path.to_string());
            }
        }
        Ok(schema)
    }

    async fn get_cardinality(
        &self,
        table: &str,
        columns: &[Column],
    ) -> Result<HashMap<String, ColumnStats>, StoreError> {
        if columns.is_empty() {
            return Ok(HashMap::new());
        }
        let mut aggs = Map::new();
        for (i, c) in columns.iter().enumerate() {
            let mut stats = Map::new();
            stats.insert(
                format!("c{i}"),
                json!({"cardinality": {"field": c.name}}),
            );
            stats.insert(
                format!("p{i}"),
                json!({"terms": {"field": c.name, "size": SET_LIMIT}}),
            );
            match c.nested_path.first() {
                Some(path) => {
                    aggs.insert(
                        format!("n{i}"),
                        json!({"nested": {"path": path}, "aggs": stats}),
                    );
                }
                None => aggs.extend(stats),
            }
        }
        let request = json!({"size": 0, "aggs": aggs});
        let response = self
            .post(&format!("{}/_search", root_table(table)), &request)
            .await?;
        let aggregations = response.get("aggregations").cloned().unwrap_or(Value::Null);

        let mut out = HashMap::new();
        for (i, c) in columns.iter().enumerate() {
            let scope = if c.nested_path.is_empty() {
                &aggregations
            } else {
                &aggregations[format!("n{i}")]
            };
            let Some(count) = scope[format!("c{i}")]["value"].as_u64() else {
                continue;
            };
            let partitions = scope[format!("p{i}")]["buckets"]
                .as_array()
                .map(|buckets| buckets.iter().map(|b| b["key"].clone()).collect())
                .unwrap_or_default();
            out.insert(c.name.clone(), ColumnStats { count, partitions });
        }
        Ok(out)
    }

    async fn search(&self, table: &str, request: &Value) -> Result<Value, StoreError> {
        self.post(&format!("{}/_search", root_table(table)), request)
            .await
    }

    async fn bulk(&self, table: &str, actions: &[Value]) -> Result<Vec<BulkItem>, StoreError> {
        let mut body = String::new();
        for action in actions {
            body.push_str(&action.to_string());
            body.push('\n');
        }
        let path = format!("{}/_bulk", root_table(table));
        tracing::debug!("POST {} ({} lines)", path, actions.len());
        let response = self
            .send(
                self.client
                    .post(self.url(&path))
                    .header("Content-Type", "application/json")
                    .body(body),
            )
            .await?;

        let items = response["items"]
            .as_array()
            .ok_or_else(|| StoreError::Decode("bulk response without items".into()))?;
        Ok(items
            .iter()
            .filter_map(|item| item.as_object()?.values().next())
            .map(|result| BulkItem {
                id: fq_core::path::value_to_string(&result["_id"]),
                status: result["status"].as_u64().unwrap_or(0) as u16,
                error: match &result["error"] {
                    Value::Null => None,
                    e => Some(fq_core::path::value_to_string(e)),
                },
            })
            .collect())
    }

    async fn get_cluster_metadata(&self) -> Result<ClusterMetadata, StoreError> {
        let response = self.get("_cluster/state/metadata").await?;
        let indices = response
            .pointer("/metadata/indices")
            .and_then(Value::as_object)
            .ok_or_else(|| StoreError::Decode("cluster state without indices".into()))?;

        let indices = indices
            .iter()
            .map(|(name, meta)| IndexMetadata {
                name: name.clone(),
                aliases: meta["aliases"]
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
                created: creation_date(meta),
                mappings: meta["mappings"]
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .map(|(ty, mapping)| {
                                let props = mapping["properties"]
                                    .as_object()
                                    .cloned()
                                    .unwrap_or_default();
                                (ty.clone(), props)
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();
        Ok(ClusterMetadata { indices })
    }

    async fn clear_cache(&self) -> Result<(), StoreError> {
        self.post("_cache/clear", &json!({})).await.map(|_| ())
    }
}

/// Index with the latest `creation_date` in `settings`, ties going to
/// the greatest name.
fn newest_index<'a>(indices: &'a Map<String, Value>, settings: &Value) -> Option<&'a String> {
    let created = |name: &str| creation_date(&settings[name]);
    indices
        .keys()
        .max_by(|a, b| (created(a.as_str()), a).cmp(&(created(b.as_str()), b)))
}

fn creation_date(meta: &Value) -> i64 {
    let raw = meta
        .pointer("/settings/index/creation_date")
        .or_else(|| meta.pointer("/settings/index.creation_date"));
    match raw {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}
