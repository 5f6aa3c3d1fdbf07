//! Set queries for `0.x` stores, which only answer through `fields`.

use super::{
    default_format, edge_summaries, filtered, header_for, selects_documents, setop, sort_request,
    Context, DEFAULT_LIMIT,
};
use fq_core::{Query, QueryError, ResultContainer};
use serde_json::{json, Value};

pub fn build_request(query: &Query) -> Value {
    let fields: Vec<&str> = if selects_documents(query) {
        vec!["_source"]
    } else {
        query.select.iter().map(|s| s.value.as_str()).collect()
    };
    let mut request = json!({
        "query": filtered(&query.filter),
        "fields": fields,
        "size": query.limit.unwrap_or(DEFAULT_LIMIT),
    });
    if !query.sort.is_empty() {
        request["sort"] = sort_request(query);
    }
    request
}

pub async fn execute(ctx: &Context<'_>, query: &Query) -> Result<ResultContainer, QueryError> {
    let response = ctx.search(&build_request(query)).await?;
    let rows = setop::decode(query, &response);
    let header = header_for(query, &rows);
    Ok(ResultContainer::new(header, rows, default_format(query)).with_edges(edge_summaries(query)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_only_request() {
        let query = Query::from_json(&json!({"from": "t", "select": ["a", "b.c"]})).unwrap();
        let request = build_request(&query);
        assert_eq!(request["fields"], json!(["a", "b.c"]));
        assert!(request.get("_source").is_none());

        let all = build_request(&Query::from_json(&json!({"from": "t"})).unwrap());
        assert_eq!(all["fields"], json!(["_source"]));
    }
}
