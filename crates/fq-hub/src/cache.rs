//! # Schema Cache
//!
//! Name-keyed cache of resolved table schemas. An entry remembers the
//! identity of the store that answered for the name; resolving the same
//! name against a store with a different identity is a hard error.
//!
//! Each key owns a [`OnceCell`] slot: the slot is created under the map's
//! write lock and the entry is built once inside it, so concurrent
//! resolvers of one name share a single backend fetch and nobody sees a
//! half-built entry. Invalidation drops the slot; the next resolve builds
//! a fresh one. A slot whose build failed is dropped too.
//!
//! A dotted name (`unittest.run.tests`) is a nested view of its root
//! table, derived from the root's columns without another fetch.

use chrono::Utc;
use fq_core::column::parse_properties;
use fq_core::path::split_field;
use fq_core::{Column, QueryError};
use fq_store::Backend;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Name suffixes of the sentinel columns written by the typed convention.
pub const TYPED_VALUE: &str = "$value";
pub const TYPED_OBJECT: &str = "$object";

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub table: String,
    pub identity: String,
    pub columns: Arc<Vec<Column>>,
    pub routing_path: Option<String>,
}

impl CacheEntry {
    /// True when the store was written through the type-wrapping
    /// convention.
    pub fn is_typed(&self) -> bool {
        is_typed(&self.columns)
    }
}

pub fn is_typed(columns: &[Column]) -> bool {
    columns.iter().any(|c| {
        split_field(&c.name)
            .last()
            .is_some_and(|s| *s == TYPED_VALUE || *s == TYPED_OBJECT)
    })
}

type Slot = Arc<OnceCell<Arc<CacheEntry>>>;

#[derive(Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<String, Slot>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns of `table`, fetched and classified on first use.
    pub fn resolve<'a>(
        &'a self,
        backend: &'a dyn Backend,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Arc<CacheEntry>, QueryError>> {
        async move {
            if table.trim().is_empty() {
                return Err(QueryError::malformed("expecting a table name"));
            }
            let identity = backend.identity(table);
            let slot = self.slot(table).await;
            let entry = match slot.get_or_try_init(|| self.build(backend, table)).await {
                Ok(entry) => entry.clone(),
                Err(e) => {
                    self.drop_failed(table, &slot).await;
                    return Err(e);
                }
            };

            if entry.identity != identity {
                tracing::error!(
                    "Table {} is served by {} but already cached from {}",
                    table,
                    identity,
                    entry.identity
                );
                return Err(QueryError::CacheConsistencyViolation {
                    name: table.to_string(),
                    existing: entry.identity.clone(),
                    conflicting: identity,
                });
            }
            Ok(entry)
        }
        .boxed()
    }

    async fn slot(&self, table: &str) -> Slot {
        if let Some(slot) = self.entries.read().await.get(table) {
            tracing::debug!("Schema cache hit for {}", table);
            return slot.clone();
        }
        let mut entries = self.entries.write().await;
        entries.entry(table.to_string()).or_default().clone()
    }

    async fn drop_failed(&self, table: &str, slot: &Slot) {
        let mut entries = self.entries.write().await;
        if entries
            .get(table)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && !s.initialized())
        {
            entries.remove(table);
        }
    }

    async fn build(&self, backend: &dyn Backend, table: &str) -> Result<Arc<CacheEntry>, QueryError> {
        let segments = split_field(table);
        if segments.len() > 1 {
            let root = segments[0];
            let parent = self.resolve(backend, root).await?;
            let columns = nested_view(table, &parent.columns, &segments[1..].join("."))?;
            return Ok(Arc::new(CacheEntry {
                table: table.to_string(),
                identity: parent.identity.clone(),
                columns: Arc::new(columns),
                routing_path: parent.routing_path.clone(),
            }));
        }

        tracing::debug!("Schema cache miss for {}, asking backend", table);
        let schema = backend.get_schema(table).await?;
        let columns = parse_properties(table, &schema.properties);
        let leaves: Vec<Column> = columns
            .iter()
            .filter(|c| !c.is_structural())
            .cloned()
            .collect();
        let stats = backend.get_cardinality(table, &leaves).await?;
        let now = Utc::now();
        let columns: Vec<Column> = columns
            .into_iter()
            .map(|c| {
                if c.is_structural() {
                    c
                } else {
                    c.classified(stats.get(&c.name), now)
                }
            })
            .collect();

        tracing::debug!(
            "Built schema for {}: {} columns, {} with statistics",
            table,
            columns.len(),
            stats.len()
        );
        Ok(Arc::new(CacheEntry {
            table: table.to_string(),
            identity: backend.identity(table),
            columns: Arc::new(columns),
            routing_path: schema.routing_path,
        }))
    }

    /// Forget `table`'s root and every nested view derived from it.
    /// Returns how many entries were dropped.
    pub async fn invalidate(&self, table: &str) -> usize {
        let root = split_field(table).first().copied().unwrap_or(table).to_string();
        let prefix = format!("{root}.");
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|name, _| name != &root && !name.starts_with(&prefix));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Columns of the nested table at `path` inside `table`'s root.
///
/// Every leaf column appears twice: once under its absolute name and once
/// under a name relative to the nested level. Columns of shallower levels
/// get one leading dot per level they sit above the view, plus one.
pub fn nested_view(table: &str, parent: &[Column], path: &str) -> Result<Vec<Column>, QueryError> {
    let anchor = parent
        .iter()
        .find(|c| c.name == path && !c.relative)
        .ok_or_else(|| QueryError::UnknownField {
            table: table.to_string(),
            field: path.to_string(),
        })?;
    let this_depth = anchor.depth();
    let prefix = format!("{path}.");

    let mut out = Vec::new();
    for c in parent.iter().filter(|c| !c.is_structural() && !c.relative) {
        out.push(Column {
            table: table.to_string(),
            abs_name: c.name.clone(),
            relative: false,
            ..c.clone()
        });

        let relative_name = if c.depth() < this_depth {
            format!("{}{}", ".".repeat(this_depth - c.depth() + 1), c.name)
        } else {
            c.name
                .strip_prefix(&prefix)
                .unwrap_or(&c.name)
                .to_string()
        };
        out.push(Column {
            table: table.to_string(),
            name: relative_name,
            abs_name: c.name.clone(),
            relative: true,
            ..c.clone()
        });
    }
    Ok(out)
}
