//! # Containers
//!
//! What a table name opens: a document table served by the backend, or
//! the metadata catalog. The choice is made from the name when the
//! container is opened.

use crate::cache::{CacheEntry, SchemaCache};
use crate::catalog::{MetadataCatalog, META_PREFIX};
use crate::dispatch::{classify, Facts};
use crate::normalize::TableSchema;
use crate::strategy::{self, Context};
use fq_core::{Column, Query, QueryError, ResultContainer};
use fq_store::Backend;
use std::sync::Arc;

/// Backend message of a request rejected for its memory footprint.
pub const DATA_TOO_LARGE: &str = "Data too large";

pub enum Container<'a> {
    Document(DocumentTable<'a>),
    Metadata(MetadataTable<'a>),
}

pub struct DocumentTable<'a> {
    backend: &'a dyn Backend,
    entry: Arc<CacheEntry>,
}

pub struct MetadataTable<'a> {
    backend: &'a dyn Backend,
    catalog: &'a MetadataCatalog,
    name: String,
}

impl<'a> Container<'a> {
    pub async fn open(
        backend: &'a dyn Backend,
        cache: &SchemaCache,
        catalog: &'a MetadataCatalog,
        name: &str,
    ) -> Result<Container<'a>, QueryError> {
        if name.starts_with(META_PREFIX) {
            return Ok(Self::Metadata(MetadataTable {
                backend,
                catalog,
                name: name.to_string(),
            }));
        }
        let entry = cache.resolve(backend, name).await?;
        Ok(Self::Document(DocumentTable { backend, entry }))
    }

    pub fn get_columns(&self) -> Result<Arc<Vec<Column>>, QueryError> {
        match self {
            Self::Document(table) => Ok(table.entry.columns.clone()),
            Self::Metadata(table) => table.catalog.get_columns(&table.name),
        }
    }

    pub async fn execute(&self, query: &Query) -> Result<ResultContainer, QueryError> {
        match self {
            Self::Document(table) => table.execute(query).await,
            Self::Metadata(table) => {
                table
                    .catalog
                    .execute(table.backend, &table.name, query)
                    .await
            }
        }
    }
}

impl DocumentTable<'_> {
    async fn execute(&self, query: &Query) -> Result<ResultContainer, QueryError> {
        let schema = TableSchema::new(&self.entry.table, &self.entry.columns);
        let shape = classify(Facts::of(query, &schema, self.backend.version()))?;
        tracing::debug!("Query on {} runs as {:?}", self.entry.table, shape);

        let ctx = Context::new(self.backend, schema);
        match strategy::run(shape, &ctx, query).await {
            Err(QueryError::Backend {
                message, status, ..
            }) if message.contains(DATA_TOO_LARGE) => {
                tracing::warn!(
                    "Backend rejected query on {} ({}), clearing its caches",
                    self.entry.table,
                    message
                );
                if let Err(e) = self.backend.clear_cache().await {
                    tracing::warn!("Cache clear failed: {}", e);
                }
                Err(QueryError::Backend {
                    message,
                    status,
                    cache_cleared: true,
                })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::META_COLUMNS;
    use fq_store::memory::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_picks_container_by_name() {
        let backend = MemoryBackend::new("mem://a").with_index("t", 1, &[], json!({"a": {"type": "string"}}));
        let cache = SchemaCache::new();
        let catalog = MetadataCatalog::new();

        let table = Container::open(&backend, &cache, &catalog, "t").await.unwrap();
        assert!(matches!(table, Container::Document(_)));
        assert_eq!(table.get_columns().unwrap()[0].name, "a");

        let meta = Container::open(&backend, &cache, &catalog, META_COLUMNS).await.unwrap();
        assert!(matches!(meta, Container::Metadata(_)));
        assert_eq!(backend.calls().metadata, 0);

        let unknown = Container::open(&backend, &cache, &catalog, "meta.tables").await.unwrap();
        assert!(matches!(
            unknown.get_columns(),
            Err(QueryError::UnknownMetadataTable(_))
        ));
    }

    #[tokio::test]
    async fn test_data_too_large_clears_cache_and_still_fails() {
        let backend = MemoryBackend::new("mem://a").with_index("t", 1, &[], json!({"a": {"type": "string"}}));
        backend
            .fail_searches_with("CircuitBreakingException[[FIELDDATA] Data too large, data for [a]]")
            .await;
        let cache = SchemaCache::new();
        let catalog = MetadataCatalog::new();
        let table = Container::open(&backend, &cache, &catalog, "t").await.unwrap();

        let query = Query::from_json(&json!({"from": "t", "select": ["a"]})).unwrap();
        let err = table.execute(&query).await.unwrap_err();
        assert!(matches!(err, QueryError::Backend { cache_cleared: true, .. }));
        assert_eq!(backend.calls().clear_cache, 1);
        assert_eq!(backend.calls().search, 1);
    }

    #[tokio::test]
    async fn test_other_backend_errors_do_not_clear() {
        let backend = MemoryBackend::new("mem://a").with_index("t", 1, &[], json!({"a": {"type": "string"}}));
        backend.fail_searches_with("shard failure").await;
        let cache = SchemaCache::new();
        let catalog = MetadataCatalog::new();
        let table = Container::open(&backend, &cache, &catalog, "t").await.unwrap();

        let query = Query::from_json(&json!({"from": "t", "select": ["a"]})).unwrap();
        let err = table.execute(&query).await.unwrap_err();
        assert!(matches!(err, QueryError::Backend { cache_cleared: false, .. }));
        assert_eq!(backend.calls().clear_cache, 0);
    }
}
