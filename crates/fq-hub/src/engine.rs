//! # Engine
//!
//! The entry point the front-end talks to. Owns the backend handle, the
//! injected schema cache and the metadata catalog, and wires the steps of
//! a query together: parse, optional freshness wait, normalize against
//! the resolved schema (inner `from` queries first), dispatch.

use crate::cache::SchemaCache;
use crate::catalog::MetadataCatalog;
use crate::config::Settings;
use crate::container::Container;
use crate::dispatch;
use crate::freshness::{self, FreshnessReport};
use crate::mutation::{MutationExecutor, UpdateCommand, UpdateSummary};
use crate::normalize::{normalize, TableSchema};
use crate::template;
use crate::translate::{LiteralTranslator, ScriptTranslator};
use fq_core::{Column, Query, QueryError, ResultContainer, Source};
use fq_store::Backend;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Engine {
    backend: Arc<dyn Backend>,
    cache: Arc<SchemaCache>,
    catalog: MetadataCatalog,
    translator: Arc<dyn ScriptTranslator>,
    settings: Settings,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<SchemaCache>, settings: Settings) -> Self {
        Self {
            backend,
            cache,
            catalog: MetadataCatalog::new(),
            translator: Arc::new(LiteralTranslator),
            settings,
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn ScriptTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    pub async fn container(&self, name: &str) -> Result<Container<'_>, QueryError> {
        Container::open(self.backend.as_ref(), &self.cache, &self.catalog, name).await
    }

    pub async fn columns(&self, table: &str) -> Result<Arc<Vec<Column>>, QueryError> {
        self.container(table).await?.get_columns()
    }

    /// Run raw query text after substituting its `{{name}}` placeholders.
    pub async fn execute_text(
        &self,
        text: &str,
        params: &HashMap<String, String>,
    ) -> Result<ResultContainer, QueryError> {
        let expanded = template::expand(text, params);
        let raw: Value = serde_json::from_str(&expanded)
            .map_err(|e| QueryError::malformed(format!("query is not JSON: {e}")))?;
        self.execute(&raw).await
    }

    pub async fn execute(&self, raw: &Value) -> Result<ResultContainer, QueryError> {
        self.execute_query(Query::from_json(raw)?).await
    }

    pub async fn execute_query(&self, query: Query) -> Result<ResultContainer, QueryError> {
        if query.meta.testing {
            if let Some(table) = query.root_table() {
                self.mark_dirty_and_wait(table).await;
            }
        }
        let query = self.prepare(query).await?;
        dispatch::execute(self, query).await
    }

    /// Normalize `query` and every query nested in its `from`.
    fn prepare(&self, mut query: Query) -> BoxFuture<'_, Result<Query, QueryError>> {
        async move {
            match std::mem::replace(&mut query.from, Source::Rows(Vec::new())) {
                Source::Table(name) => {
                    let columns = self.columns(&name).await?;
                    query.from = Source::Table(name.clone());
                    normalize(query, Some(&TableSchema::new(&name, &columns)))
                }
                Source::Query(inner) => {
                    query.from = Source::Query(Box::new(self.prepare(*inner).await?));
                    normalize(query, None)
                }
                rows => {
                    query.from = rows;
                    normalize(query, None)
                }
            }
        }
        .boxed()
    }

    pub async fn update(&self, table: &str, raw: &Value) -> Result<UpdateSummary, QueryError> {
        let command = UpdateCommand::from_json(raw)?;
        MutationExecutor {
            backend: self.backend.as_ref(),
            cache: &self.cache,
            translator: self.translator.as_ref(),
            max_matches: self.settings.max_matches,
        }
        .update(table, &command)
        .await
    }

    pub async fn mark_dirty_and_wait(&self, table: &str) -> FreshnessReport {
        freshness::mark_dirty_and_wait(&self.cache, self.backend.as_ref(), table, &self.settings).await
    }
}
