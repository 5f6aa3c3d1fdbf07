//! # Metadata Catalog
//!
//! The virtual table `meta.columns`: one row per (index or alias, column)
//! across the whole cluster. Built once from the cluster metadata on first
//! use. Indices are visited newest first and an alias takes the columns of
//! the first index that claims it.

use crate::list::ListContainer;
use fq_core::column::parse_properties;
use fq_core::{Column, Query, QueryError, ResultContainer, Row, Sort};
use fq_store::{Backend, ClusterMetadata};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub const META_COLUMNS: &str = "meta.columns";

/// Prefix every metadata table name starts with.
pub const META_PREFIX: &str = "meta.";

pub struct MetadataCatalog {
    schema: Arc<Vec<Column>>,
    rows: OnceCell<Arc<Vec<Row>>>,
}

impl Default for MetadataCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCatalog {
    pub fn new() -> Self {
        let schema = ["table", "name", "type", "nested_path"]
            .into_iter()
            .map(|name| Column::new(META_COLUMNS, name, "string", Vec::new()))
            .collect();
        Self {
            schema: Arc::new(schema),
            rows: OnceCell::new(),
        }
    }

    pub fn get_columns(&self, name: &str) -> Result<Arc<Vec<Column>>, QueryError> {
        if name == META_COLUMNS {
            Ok(self.schema.clone())
        } else {
            Err(QueryError::UnknownMetadataTable(name.to_string()))
        }
    }

    pub async fn rows(&self, backend: &dyn Backend) -> Result<Arc<Vec<Row>>, QueryError> {
        let rows = self
            .rows
            .get_or_try_init(|| async {
                let metadata = backend.get_cluster_metadata().await?;
                let rows = catalog_rows(metadata);
                tracing::info!("Built {} with {} rows", META_COLUMNS, rows.len());
                Ok::<_, QueryError>(Arc::new(rows))
            })
            .await?;
        Ok(rows.clone())
    }

    /// Answer `query` over the catalog rows, sorted by `(table, name)`
    /// unless the query sorts itself.
    pub async fn execute(
        &self,
        backend: &dyn Backend,
        name: &str,
        query: &Query,
    ) -> Result<ResultContainer, QueryError> {
        self.get_columns(name)?;
        let rows = self.rows(backend).await?;
        let mut query = query.clone();
        if query.sort.is_empty() {
            query.sort = vec![Sort::asc("table"), Sort::asc("name")];
        }
        ListContainer::new(rows.to_vec()).query(&query)
    }
}

fn catalog_rows(mut metadata: ClusterMetadata) -> Vec<Row> {
    metadata
        .indices
        .sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));

    let mut rows = Vec::new();
    let mut claimed: HashSet<String> = HashSet::new();
    for index in &metadata.indices {
        let mut properties = Map::new();
        for (_, props) in &index.mappings {
            properties.extend(props.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let columns = parse_properties(&index.name, &properties);

        let mut tables = vec![index.name.as_str()];
        for alias in &index.aliases {
            if claimed.insert(alias.clone()) {
                tables.push(alias);
            }
        }
        for table in tables {
            rows.extend(columns.iter().map(|c| row(table, c)));
        }
    }
    rows
}

fn row(table: &str, column: &Column) -> Row {
    let nested_path = if column.nested_path.is_empty() {
        Value::Null
    } else {
        json!(column.nested_path)
    };
    let mut row = Map::new();
    row.insert("table".into(), json!(table));
    row.insert("name".into(), json!(column.name));
    row.insert("type".into(), json!(column.data_type));
    row.insert("nested_path".into(), nested_path);
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use fq_store::memory::MemoryBackend;

    fn backend() -> MemoryBackend {
        MemoryBackend::new("mem://a")
            .with_index(
                "runs_20240101",
                1_000,
                &["runs"],
                json!({"old_field": {"type": "string"}}),
            )
            .with_index(
                "runs_20240201",
                2_000,
                &["runs"],
                json!({"new_field": {"type": "long"}, "f": {"type": "nested", "properties": {"x": {"type": "string"}}}}),
            )
    }

    fn query(q: Value) -> Query {
        Query::from_json(&q).unwrap()
    }

    #[tokio::test]
    async fn test_alias_takes_columns_of_newest_index() {
        let backend = backend();
        let catalog = MetadataCatalog::new();
        let result = catalog
            .execute(
                &backend,
                META_COLUMNS,
                &query(json!({"from": META_COLUMNS, "select": ["name"], "where": {"eq": {"table": "runs"}}})),
            )
            .await
            .unwrap();
        let names = result.column("name");
        assert!(names.contains(&json!("new_field")));
        assert!(names.contains(&json!("f.x")));
        assert!(!names.contains(&json!("old_field")));
    }

    #[tokio::test]
    async fn test_default_sort_and_lazy_build() {
        let backend = backend();
        let catalog = MetadataCatalog::new();
        let q = query(json!({"from": META_COLUMNS, "select": ["table", "name"], "limit": 100}));
        let result = catalog.execute(&backend, META_COLUMNS, &q).await.unwrap();
        let tables = result.column("table");
        let mut sorted = tables.clone();
        sorted.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        assert_eq!(tables, sorted);
        assert_eq!(tables.first(), Some(&json!("runs")));

        catalog.execute(&backend, META_COLUMNS, &q).await.unwrap();
        assert_eq!(backend.calls().metadata, 1);
    }

    #[tokio::test]
    async fn test_nested_path_rows() {
        let backend = backend();
        let catalog = MetadataCatalog::new();
        let q = query(json!({"from": META_COLUMNS, "where": {"and": [
            {"eq": {"table": "runs_20240201"}},
            {"eq": {"name": "f.x"}}
        ]}}));
        let result = catalog.execute(&backend, META_COLUMNS, &q).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows[0]["nested_path"], json!(["f"]));
        assert_eq!(result.rows[0]["type"], json!("string"));
    }

    #[test]
    fn test_unknown_metadata_table() {
        let catalog = MetadataCatalog::new();
        assert!(matches!(
            catalog.get_columns("meta.tables"),
            Err(QueryError::UnknownMetadataTable(name)) if name == "meta.tables"
        ));
        assert_eq!(catalog.get_columns(META_COLUMNS).unwrap().len(), 4);
    }
}
