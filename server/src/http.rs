//! HTTP/JSON API (spec §6): store/version lifecycle, indexing, search, the
//! ML gateway pass-through, and observability endpoints. All handlers share
//! one [`AppState`] and translate `CoreError` to status codes via
//! [`crate::error::ApiError`].

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use codecortex_core::config::{validate_store_name, SearchFilter, SearchOptions, VersionConfig};
use codecortex_core::document::Document;
use codecortex_core::error::CoreError;

use crate::error::ApiError;
use crate::search::{self, SearchRequest};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/stores", get(list_stores).post(create_store))
        .route("/v1/stores/{name}", get(get_store).delete(delete_store))
        .route("/v1/stores/{name}/versions", post(create_version))
        .route("/v1/stores/{name}/versions/{version}/ready", post(mark_ready))
        .route("/v1/stores/{name}/versions/{version}/promote", post(promote_version))
        .route("/v1/stores/{name}/versions/{version}/deprecate", post(deprecate_version))
        .route("/v1/stores/{name}/versions/{version}", delete(delete_version))
        .route("/v1/stores/{name}/stats", get(store_stats))
        .route("/v1/stores/{name}/search", post(search_store))
        .route("/v1/stores/{name}/search/dense", post(search_dense))
        .route("/v1/stores/{name}/search/sparse", post(search_sparse))
        .route("/v1/stores/{name}/index", post(index_files).delete(delete_index))
        .route("/v1/stores/{name}/index/sync", post(sync_index))
        .route("/v1/stores/{name}/index/reindex", post(reindex))
        .route("/v1/stores/{name}/index/files", get(list_indexed_files))
        .route("/v1/ml/embed", post(ml_embed))
        .route("/v1/ml/sparse", post(ml_sparse))
        .route("/v1/ml/rerank", post(ml_rerank))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/health", get(health_detail))
        .route("/v1/version", get(version))
        .route("/metrics", get(metrics))
        .route("/v1/observability/stats", get(observability_stats))
        .route("/v1/observability/query-stats", get(observability_query_stats))
        .route("/v1/observability/recent-queries", get(observability_recent_queries))
        .route("/v1/observability/telemetry", get(observability_telemetry))
}

fn connection_id(headers: &HeaderMap, filter: &Option<SearchFilter>) -> Option<String> {
    let opt_out = filter
        .as_ref()
        .and_then(|f| f.connection_id.as_deref())
        .map(|v| v == "*" || v.eq_ignore_ascii_case("all"))
        .unwrap_or(false);
    if opt_out {
        return None;
    }
    headers.get("x-connection-id").and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// Store / version lifecycle
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateStoreBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

async fn list_stores(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.registry.list_stores())
}

async fn create_store(
    State(state): State<AppState>,
    Json(body): Json<CreateStoreBody>,
) -> Result<impl IntoResponse, ApiError> {
    validate_store_name(&body.name)?;
    state.runtime.registry.create_store(&body.name, &body.description)?;
    Ok((StatusCode::CREATED, Json(state.runtime.registry.get_store(&body.name)?)))
}

async fn get_store(State(state): State<AppState>, Path(name): Path<String>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runtime.registry.get_store(&name)?))
}

async fn delete_store(State(state): State<AppState>, Path(name): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.runtime.registry.delete_store(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_version(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<VersionConfig>,
) -> Result<impl IntoResponse, ApiError> {
    config.validate()?;
    let record = state.runtime.registry.create_version(&name, config)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn mark_ready(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.runtime.registry.mark_ready(&name, &version)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn promote_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.runtime.registry.promote(&name, &version)?;
    state.runtime.bus.publish(
        codecortex_core::bus::TOPIC_VERSION_PROMOTED,
        serde_json::json!({ "store": name, "version": version }),
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn deprecate_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.runtime.registry.deprecate(&name, &version)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.runtime.registry.delete_version(&name, &version)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct StoreStats {
    store: String,
    active_version: Option<String>,
    version_count: usize,
    indexed_files: usize,
}

async fn store_stats(State(state): State<AppState>, Path(name): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let record = state.runtime.registry.get_store(&name)?;
    let indexed_files = state.runtime.tracker.paths(&name)?.len();
    Ok(Json(StoreStats {
        store: record.name,
        active_version: record.active_version,
        version_count: record.versions.len(),
        indexed_files,
    }))
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SearchBody {
    pub query: String,
    pub version: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filter: Option<SearchFilter>,
    #[serde(default)]
    pub enable_reranking: Option<bool>,
    #[serde(default)]
    pub rerank_top_k: Option<usize>,
    #[serde(default)]
    pub include_content: Option<bool>,
    #[serde(default)]
    pub sparse_weight: Option<f64>,
    #[serde(default)]
    pub dense_weight: Option<f64>,
    #[serde(default)]
    pub group_by_file: Option<bool>,
    #[serde(default)]
    pub max_per_file: Option<usize>,
}

fn options_from(body: SearchBody) -> SearchOptions {
    SearchOptions {
        query: body.query,
        top_k: body.top_k.unwrap_or(20),
        filter: body.filter,
        enable_reranking: body.enable_reranking.unwrap_or(true),
        rerank_top_k: body.rerank_top_k,
        include_content: body.include_content.unwrap_or(false),
        sparse_weight: body.sparse_weight,
        dense_weight: body.dense_weight,
        group_by_file: body.group_by_file.unwrap_or(false),
        max_per_file: body.max_per_file,
    }
}

async fn run_search(
    state: AppState,
    headers: HeaderMap,
    name: String,
    body: SearchBody,
) -> Result<impl IntoResponse, ApiError> {
    let version = body.version.clone();
    let filter = body.filter.clone();
    let connection_id = connection_id(&headers, &filter);
    let options = options_from(body);
    let request = SearchRequest { store: name, version, options, connection_id };
    let response = search::search(&state.runtime, request).await?;
    Ok(Json(response))
}

async fn search_store(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Result<impl IntoResponse, ApiError> {
    run_search(state, headers, name, body).await
}

async fn search_dense(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<SearchBody>,
) -> Result<impl IntoResponse, ApiError> {
    body.sparse_weight = Some(0.0);
    body.dense_weight = Some(1.0);
    run_search(state, headers, name, body).await
}

async fn search_sparse(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<SearchBody>,
) -> Result<impl IntoResponse, ApiError> {
    body.sparse_weight = Some(1.0);
    body.dense_weight = Some(0.0);
    run_search(state, headers, name, body).await
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct IndexBody {
    pub documents: Vec<Document>,
    pub version: Option<String>,
    #[serde(default)]
    pub force: bool,
}

async fn index_files(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<IndexBody>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.runtime.registry.resolve(&name, body.version.as_deref())?;
    let report = state.runtime.index_pipeline.index(&resolved, body.documents, body.force).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
pub struct DeleteIndexBody {
    pub version: Option<String>,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

async fn delete_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<DeleteIndexBody>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.runtime.registry.resolve(&name, body.version.as_deref())?;
    let deleted = if let Some(prefix) = &body.path_prefix {
        state.runtime.index_pipeline.delete_by_prefix(&resolved, prefix).await?
    } else if let Some(paths) = &body.paths {
        state.runtime.index_pipeline.delete(&resolved, paths).await?
    } else {
        return Err(CoreError::validation("must supply paths or path_prefix").into());
    };
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Deserialize)]
pub struct SyncBody {
    pub version: Option<String>,
    pub current_paths: Vec<String>,
}

async fn sync_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SyncBody>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.runtime.registry.resolve(&name, body.version.as_deref())?;
    let removed = state.runtime.index_pipeline.sync(&resolved, &body.current_paths).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn reindex(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<IndexBody>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.runtime.registry.resolve(&name, body.version.as_deref())?;
    let report = state.runtime.index_pipeline.index(&resolved, body.documents, true).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}
fn default_page() -> usize {
    1
}
fn default_page_size() -> usize {
    100
}

async fn list_indexed_files(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut paths = state.runtime.tracker.paths(&name)?;
    paths.sort();
    let page = q.page.max(1);
    let page_size = q.page_size.clamp(1, 1000);
    let start = (page - 1) * page_size;
    let items: Vec<String> = paths.into_iter().skip(start).take(page_size).collect();
    Ok(Json(serde_json::json!({ "page": page, "page_size": page_size, "files": items })))
}

// ---------------------------------------------------------------------------
// ML gateway pass-through
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct EmbedBody {
    pub texts: Vec<String>,
}

async fn ml_embed(State(state): State<AppState>, Json(body): Json<EmbedBody>) -> Result<impl IntoResponse, ApiError> {
    let vectors = state.runtime.gateway.embed(&body.texts).await?;
    Ok(Json(vectors))
}

async fn ml_sparse(State(state): State<AppState>, Json(body): Json<EmbedBody>) -> Result<impl IntoResponse, ApiError> {
    let vectors = state.runtime.gateway.sparse_encode(&body.texts).await?;
    Ok(Json(vectors))
}

#[derive(Deserialize)]
pub struct RerankBody {
    pub query: String,
    pub documents: Vec<String>,
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
}
fn default_rerank_top_k() -> usize {
    10
}

async fn ml_rerank(State(state): State<AppState>, Json(body): Json<RerankBody>) -> Result<impl IntoResponse, ApiError> {
    let ranked = state.runtime.gateway.rerank(&body.query, &body.documents, body.top_k).await?;
    Ok(Json(ranked))
}

// ---------------------------------------------------------------------------
// Health, version, metrics, observability
// ---------------------------------------------------------------------------

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.runtime.lifecycle.readiness();
    let status = if report.ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

async fn health_detail(State(state): State<AppState>) -> impl IntoResponse {
    let capability_health = state.runtime.gateway.health();
    let engine_health = state.runtime.engine.health().await.unwrap_or_else(|e| e.to_string());
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "readiness": state.runtime.lifecycle.readiness(),
        "capabilities": capability_health,
        "vector_engine": engine_health,
    }))
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.runtime.telemetry.export_prometheus(),
    )
}

async fn observability_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stores = state.runtime.telemetry.stores();
    let aggregates: HashMap<String, _> =
        stores.into_iter().map(|s| { let agg = state.runtime.telemetry.aggregate(&s); (s, agg) }).collect();
    Json(aggregates)
}

async fn observability_query_stats(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let store = params.get("store").cloned().ok_or_else(|| CoreError::validation("store query param required"))?;
    Ok(Json(state.runtime.telemetry.aggregate(&store)))
}

async fn observability_recent_queries(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let n: usize = params.get("n").and_then(|v| v.parse().ok()).unwrap_or(50);
    Json(state.runtime.telemetry.recent(n))
}

async fn observability_telemetry(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let n: usize = params.get("n").and_then(|v| v.parse().ok()).unwrap_or(100);
    Json(state.runtime.telemetry.recent(n))
}
