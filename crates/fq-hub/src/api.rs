//! # API Handlers
//!
//! Axum front-end over the [`Engine`]. Engine errors render as their
//! structured JSON with status 400.

use crate::engine::Engine;
use crate::freshness::FreshnessReport;
use crate::mutation::UpdateSummary;
use axum::{
    extract::{Path, Query as Params, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use fq_core::result::TOTAL_TIME_PLACEHOLDER;
use fq_core::{Column, QueryError};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;

pub struct AppState {
    pub engine: Engine,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<QueryError>)>;

fn reject(e: QueryError) -> (StatusCode, Json<QueryError>) {
    tracing::debug!("Request failed: {}", e);
    (StatusCode::BAD_REQUEST, Json(e))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/query", post(execute_query))
        .route("/update/:table", post(update))
        .route("/tables/:table/refresh", post(refresh))
        .route("/tables/:table/columns", get(columns))
        .layer(middleware::from_fn(request_id))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Tag every request with an id, in the log and the response headers.
async fn request_id(request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().as_simple().to_string();
    let started = Instant::now();
    tracing::info!("[{}] {} {}", id, request.method(), request.uri().path());
    let mut response = next.run(request).await;
    tracing::info!("[{}] {} in {:?}", id, response.status(), started.elapsed());
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// =============================================================================
// Query
// =============================================================================

/// Body is query text; query-string parameters fill its placeholders.
pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    Params(params): Params<HashMap<String, String>>,
    body: String,
) -> ApiResult<Value> {
    let started = Instant::now();
    let result = state
        .engine
        .execute_text(&body, &params)
        .await
        .map_err(reject)?;
    let mut out = result.to_json().map_err(reject)?;
    fill_timing(&mut out, started.elapsed());
    Ok(Json(out))
}

pub fn fill_timing(out: &mut Value, elapsed: Duration) {
    if let Some(total) = out.pointer_mut("/meta/timing/total") {
        if total.as_str() == Some(TOTAL_TIME_PLACEHOLDER) {
            *total = json!(elapsed.as_secs_f64());
        }
    }
}

// =============================================================================
// Tables
// =============================================================================

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Json(command): Json<Value>,
) -> ApiResult<UpdateSummary> {
    let summary = state.engine.update(&table, &command).await.map_err(reject)?;
    Ok(Json(summary))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
) -> Json<FreshnessReport> {
    Json(state.engine.mark_dirty_and_wait(&table).await)
}

#[derive(Debug, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nested_path: Vec<String>,
    pub cardinality: Option<u64>,
    pub relative: bool,
}

impl From<&Column> for ColumnInfo {
    fn from(c: &Column) -> Self {
        Self {
            name: c.name.clone(),
            data_type: c.data_type.clone(),
            nested_path: c.nested_path.clone(),
            cardinality: c.cardinality,
            relative: c.relative,
        }
    }
}

pub async fn columns(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
) -> ApiResult<Vec<ColumnInfo>> {
    let columns = state.engine.columns(&table).await.map_err(reject)?;
    Ok(Json(columns.iter().map(ColumnInfo::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SchemaCache;
    use crate::config::Settings;
    use fq_store::memory::MemoryBackend;

    fn state() -> Arc<AppState> {
        let backend = MemoryBackend::new("mem://a")
            .with_index("t", 1, &[], json!({"a": {"type": "string"}}))
            .with_documents("t", vec![("1", json!({"a": "x"})), ("2", json!({"a": "y"}))]);
        Arc::new(AppState {
            engine: Engine::new(Arc::new(backend), Arc::new(SchemaCache::new()), Settings::default()),
        })
    }

    #[test]
    fn test_fill_timing() {
        let mut out = json!({"meta": {"timing": {"total": TOTAL_TIME_PLACEHOLDER}}});
        fill_timing(&mut out, Duration::from_millis(1500));
        assert_eq!(out["meta"]["timing"]["total"], json!(1.5));
    }

    #[tokio::test]
    async fn test_query_handler_renders_result() {
        let params = HashMap::from([("v".to_string(), "y".to_string())]);
        let Json(out) = execute_query(
            State(state()),
            Params(params),
            r#"{"from": "t", "select": ["a"], "where": {"eq": {"a": "{{v}}"}}}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(out["data"], json!([{"a": "y"}]));
        assert!(out["meta"]["timing"]["total"].is_number());
    }

    #[tokio::test]
    async fn test_errors_are_structured() {
        let (status, Json(err)) = execute_query(State(state()), Params(HashMap::new()), "{not json".to_string())
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = serde_json::to_value(&err).unwrap();
        assert_eq!(body["kind"], json!("malformed_input"));
    }

    #[tokio::test]
    async fn test_columns_handler() {
        let Json(columns) = columns(State(state()), Path("t".to_string())).await.unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].name, "a");
        assert_eq!(columns[0].cardinality, Some(2));
    }
}
