//! # Mutation Executor
//!
//! `{"set": {field: value}, "where": filter}` becomes one bulk request:
//! the matching documents are found first (ids and routing keys only),
//! then every match gets one update action per `set` entry. A value of
//! the form `{"doc": {...}}` merges that document; anything else is
//! assigned through the script translator.
//!
//! Items the backend rejects are reported together; the others stay
//! applied.

use crate::cache::SchemaCache;
use crate::normalize::TableSchema;
use crate::strategy::{filtered, hits};
use crate::translate::ScriptTranslator;
use fq_core::path::{is_keyword, unwrap_list, value_to_string};
use fq_core::{FailedItem, Filter, QueryError};
use fq_store::{root_table, Backend};
use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCommand {
    pub set: Map<String, Value>,
    pub filter: Filter,
}

impl UpdateCommand {
    pub fn from_json(raw: &Value) -> Result<Self, QueryError> {
        let set = raw
            .get("set")
            .and_then(Value::as_object)
            .ok_or_else(|| QueryError::malformed("update needs a `set` object"))?;
        if set.is_empty() {
            return Err(QueryError::malformed("update `set` is empty"));
        }
        if let Some(bad) = set.keys().find(|k| !is_keyword(k)) {
            return Err(QueryError::malformed(format!(
                "can not set `{bad}`, expecting a simple field name"
            )));
        }
        Ok(Self {
            set: set.clone(),
            filter: Filter::parse(raw.get("where").unwrap_or(&Value::Null))?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    /// Documents the filter matched.
    pub matched: usize,
    /// Bulk actions submitted.
    pub actions: usize,
}

pub struct MutationExecutor<'a> {
    pub backend: &'a dyn Backend,
    pub cache: &'a SchemaCache,
    pub translator: &'a dyn ScriptTranslator,
    pub max_matches: usize,
}

impl MutationExecutor<'_> {
    pub async fn update(&self, table: &str, command: &UpdateCommand) -> Result<UpdateSummary, QueryError> {
        let entry = self.cache.resolve(self.backend, table).await?;
        let schema = TableSchema::new(table, &entry.columns);
        let filter = command
            .filter
            .try_map_fields(&mut |f: &str| schema.resolve_field(f))?;

        let index = root_table(table);
        let routing = entry.routing_path.as_deref();
        let request = json!({
            "query": filtered(&filter),
            "fields": routing.map(|r| vec![r]).unwrap_or_default(),
            "_source": false,
            "size": self.max_matches,
        });
        let response = self.backend.search(index, &request).await?;
        let matches = hits(&response);
        if matches.is_empty() {
            tracing::info!("Update of {} matched no documents", table);
            return Ok(UpdateSummary::default());
        }

        let actions = build_actions(matches, routing, &command.set, self.translator)?;
        let items = self.backend.bulk(index, &actions).await?;
        let failures: Vec<FailedItem> = items
            .iter()
            .filter(|item| !item.is_success())
            .map(|item| FailedItem {
                id: item.id.clone(),
                status: item.status,
                error: item.error.clone(),
            })
            .collect();
        if !failures.is_empty() {
            tracing::error!(
                "Update of {}: {} of {} actions failed",
                table,
                failures.len(),
                items.len()
            );
            return Err(QueryError::PartialMutationFailure { failures });
        }

        tracing::info!(
            "Updated {} documents of {} ({} actions)",
            matches.len(),
            table,
            items.len()
        );
        Ok(UpdateSummary {
            matched: matches.len(),
            actions: items.len(),
        })
    }
}

/// Header and body lines of the bulk request, one pair per hit and
/// `set` entry.
pub fn build_actions(
    matches: &[Value],
    routing: Option<&str>,
    set: &Map<String, Value>,
    translator: &dyn ScriptTranslator,
) -> Result<Vec<Value>, QueryError> {
    let mut actions = Vec::with_capacity(matches.len() * set.len() * 2);
    for hit in matches {
        let mut header = json!({"_id": value_to_string(&hit["_id"])});
        if let Some(path) = routing {
            let key = unwrap_list(&hit["fields"][path]);
            if !key.is_null() {
                header["_routing"] = key;
            }
        }
        for (field, value) in set {
            actions.push(json!({"update": header}));
            actions.push(match value.get("doc") {
                Some(doc) if value.is_object() => json!({"doc": doc}),
                _ => json!({"script": translator.assignment(field, value)?}),
            });
        }
    }
    Ok(actions)
}
