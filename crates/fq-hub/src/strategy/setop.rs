//! Flat set queries: filter, project, sort and limit in one `_search`.

use super::{
    default_format, edge_summaries, filtered, header_for, hits, project, selects_documents,
    sort_request, Context, DEFAULT_LIMIT,
};
use fq_core::{Query, QueryError, ResultContainer, Row};
use serde_json::{json, Value};

pub fn build_request(ctx: &Context<'_>, query: &Query) -> Value {
    let mut request = json!({
        "query": filtered(&query.filter),
        "size": query.limit.unwrap_or(DEFAULT_LIMIT),
    });
    if !query.sort.is_empty() {
        request["sort"] = sort_request(query);
    }
    if selects_documents(query) {
        request["_source"] = Value::Bool(true);
        return request;
    }

    // Indexed leaves come back as stored fields; the rest from `_source`.
    let (stored, source): (Vec<&str>, Vec<&str>) = query
        .select
        .iter()
        .map(|s| s.value.as_str())
        .partition(|field| {
            ctx.schema
                .column(field)
                .is_some_and(|c| !c.is_structural() && !c.use_source)
        });
    if !stored.is_empty() {
        request["fields"] = json!(stored);
    }
    request["_source"] = if source.is_empty() {
        Value::Bool(false)
    } else {
        json!(source)
    };
    request
}

/// Rows from a set-shaped response.
pub fn decode(query: &Query, response: &Value) -> Vec<Row> {
    hits(response)
        .iter()
        .map(|hit| {
            let fields = hit.get("fields");
            project(&query.select, &hit["_source"], fields)
        })
        .collect()
}

pub async fn execute(ctx: &Context<'_>, query: &Query) -> Result<ResultContainer, QueryError> {
    let request = build_request(ctx, query);
    let response = ctx.search(&request).await?;
    let rows = decode(query, &response);
    let header = header_for(query, &rows);
    Ok(ResultContainer::new(header, rows, default_format(query)).with_edges(edge_summaries(query)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::TableSchema;
    use fq_core::Column;
    use fq_store::memory::MemoryBackend;

    fn columns() -> Vec<Column> {
        let mut raw = Column::new("t", "raw", "string", vec![]);
        raw.use_source = true;
        vec![Column::new("t", "a", "string", vec![]), raw]
    }

    #[test]
    fn test_request_splits_stored_and_source_fields() {
        let backend = MemoryBackend::new("mem://a");
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let query = Query::from_json(&json!({
            "from": "t",
            "select": ["a", "raw"],
            "where": {"eq": {"a": "x"}}
        }))
        .unwrap();
        let request = build_request(&ctx, &query);
        assert_eq!(request["fields"], json!(["a"]));
        assert_eq!(request["_source"], json!(["raw"]));
        assert_eq!(request["size"], json!(DEFAULT_LIMIT));
        assert_eq!(
            request["query"]["filtered"]["filter"],
            json!({"term": {"a": "x"}})
        );
    }

    #[test]
    fn test_whole_documents_request_source() {
        let backend = MemoryBackend::new("mem://a");
        let columns = columns();
        let ctx = Context::new(&backend, TableSchema::new("t", &columns));
        let query = Query::from_json(&json!({"from": "t", "limit": 3})).unwrap();
        let request = build_request(&ctx, &query);
        assert_eq!(request["_source"], json!(true));
        assert_eq!(request["size"], json!(3));
        assert!(request.get("fields").is_none());
    }
}
