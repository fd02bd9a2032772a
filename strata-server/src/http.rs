//! Strata HTTP REST API
//!
//! Axum-based server exposing graph storage, retrieval and legacy import.
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, body)`. The inner functions take the shared state
//! directly so tests can drive them without the router.
//!
//! Endpoints:
//! - GET  /health, /version
//! - POST /nodes, GET /nodes, POST /query
//! - GET|PUT|DELETE /nodes/:id, GET /nodes/:id/edges, GET /nodes/:id/related
//! - POST /edges, DELETE /edges/:id
//! - GET  /search, /traverse/:id, /subgraph/:id, /paths
//! - POST /context/{path,entity,relation,hybrid,multi,query}
//! - POST /bulk/nodes, /bulk/edges, /import
//! - GET  /schema, /stats, /topics/tree, /topics/:id/tasks, /tasks, /goals/:id/alignment
//! - GET  /taxonomy, POST /taxonomy/refresh
//! - POST /admin/repair

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use strata_core::blob::{create_store, BlobStore};
use strata_core::models::{Direction, EdgeSpec, GraphContext, NodeQuery, NodeSpec};
use strata_core::service::HybridRequest;
use strata_core::{
    format_for_llm, BackendProvider, ContextFormat, GraphBackend, GraphError, GraphService,
    RetrievalMode, StrataConfig, SubgraphService,
};
use strata_import::{run_import, ImportOptions, ImportSource, TaxonomyCache};

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub provider: BackendProvider,
    pub store: Arc<dyn BlobStore>,
    pub taxonomy: TaxonomyCache,
    pub config: StrataConfig,
}

impl HttpState {
    pub fn new(config: StrataConfig, store: Arc<dyn BlobStore>, provider: BackendProvider) -> Self {
        let taxonomy = TaxonomyCache::new(Arc::clone(&store), &config.taxonomy);
        Self {
            provider,
            store,
            taxonomy,
            config,
        }
    }

    /// Build the blob store and backend provider described by `config`.
    pub async fn from_config(config: StrataConfig) -> Result<Self> {
        let store = create_store(&config.blob)?;
        let provider = BackendProvider::from_config(&config, Arc::clone(&store)).await?;
        Ok(Self::new(config, store, provider))
    }

    /// One backend per request; blob backends cache indexes for their lifetime.
    fn backend(&self) -> Arc<dyn GraphBackend> {
        self.provider.backend()
    }

    fn graph(&self) -> GraphService {
        GraphService::new(self.backend())
    }

    fn retrieval(&self) -> SubgraphService {
        SubgraphService::new(self.backend()).with_limits(self.config.retrieval.clone())
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/nodes", post(create_node_handler).get(list_nodes_handler))
        .route("/query", post(query_nodes_handler))
        .route(
            "/nodes/:id",
            get(get_node_handler)
                .put(update_node_handler)
                .delete(delete_node_handler),
        )
        .route("/nodes/:id/edges", get(node_edges_handler))
        .route("/nodes/:id/related", get(related_nodes_handler))
        .route("/edges", post(create_edge_handler))
        .route("/edges/:id", axum::routing::delete(delete_edge_handler))
        .route("/search", get(search_handler))
        .route("/traverse/:id", get(traverse_handler))
        .route("/subgraph/:id", get(subgraph_handler))
        .route("/paths", get(paths_handler))
        .route("/context/path", post(path_context_handler))
        .route("/context/entity", post(entity_context_handler))
        .route("/context/relation", post(relation_context_handler))
        .route("/context/hybrid", post(hybrid_context_handler))
        .route("/context/multi", post(multi_context_handler))
        .route("/context/query", post(query_context_handler))
        .route("/bulk/nodes", post(bulk_nodes_handler))
        .route("/bulk/edges", post(bulk_edges_handler))
        .route("/import", post(import_handler))
        .route("/schema", get(schema_handler))
        .route("/stats", get(stats_handler))
        .route("/topics/tree", get(topic_tree_handler))
        .route("/topics/:id/tasks", get(topic_tasks_handler))
        .route("/tasks", get(tasks_handler))
        .route("/goals/:id/alignment", get(goal_alignment_handler))
        .route("/taxonomy", get(taxonomy_handler))
        .route("/taxonomy/refresh", post(taxonomy_refresh_handler))
        .route("/admin/repair", post(repair_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(state: Arc<HttpState>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Strata HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct CreateNodeRequest {
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateNodeRequest {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default = "default_true")]
    pub merge: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListNodesParams {
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EdgeParams {
    pub direction: Option<String>,
    pub relation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateEdgeRequest {
    pub from_id: Option<String>,
    pub relation: Option<String>,
    pub to_id: Option<String>,
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchParams {
    pub q: Option<String>,
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub limit: Option<usize>,
    /// Comma-separated property names.
    pub fields: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TraverseParams {
    pub depth: Option<usize>,
    pub direction: Option<String>,
    pub relations: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SubgraphParams {
    pub depth: Option<usize>,
    pub types: Option<String>,
    pub max_nodes: Option<usize>,
    pub format: Option<String>,
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PathsParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub max_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PathContextRequest {
    #[serde(default)]
    pub node_ids: Vec<String>,
    pub max_depth: Option<usize>,
    pub max_paths: Option<usize>,
    pub relations: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct EntityContextRequest {
    #[serde(default)]
    pub entity_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub include_relations: bool,
    pub depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RelationContextRequest {
    #[serde(default)]
    pub relation_types: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct MultiContextRequest {
    #[serde(default)]
    pub node_ids: Vec<String>,
    pub depth: Option<usize>,
    pub types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct QueryContextRequest {
    pub query: Option<String>,
    pub mode: Option<String>,
    pub max_nodes: Option<usize>,
    pub format: Option<String>,
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BulkNodesRequest {
    #[serde(default)]
    pub nodes: Vec<Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BulkEdgesRequest {
    #[serde(default)]
    pub edges: Vec<Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ImportRequest {
    pub source: Option<String>,
    #[serde(default)]
    pub options: ImportOptions,
}

#[derive(Debug, Deserialize, Default)]
pub struct TopicTreeParams {
    pub root: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TasksParams {
    pub status: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    fn into_value(self) -> Value {
        json!({"error": self.error, "status": self.status})
    }
}

/// Body of a response: JSON for data, plain text for rendered prompt context.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Json(Value),
    Text(String),
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Json(body) => Json(body).into_response(),
            Reply::Text(text) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response(),
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

pub fn status_for(err: &GraphError) -> StatusCode {
    match err {
        GraphError::Validation(_) => StatusCode::BAD_REQUEST,
        GraphError::NotFound { .. } => StatusCode::NOT_FOUND,
        GraphError::AlreadyExists(_) | GraphError::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &GraphError) -> (StatusCode, Value) {
    let status = status_for(err);
    if status.is_server_error() {
        tracing::error!(event = "api_error", kind = err.kind(), error = %err, "Request failed");
    } else {
        tracing::debug!(event = "api_rejected", kind = err.kind(), error = %err, "Request rejected");
    }
    (status, ErrorResponse::new(err.to_string()).into_value())
}

/// Import errors arrive as `anyhow`; graph errors keep their status.
pub fn anyhow_response(err: &anyhow::Error) -> (StatusCode, Value) {
    match err.downcast_ref::<GraphError>() {
        Some(graph_err) => error_response(graph_err),
        None => {
            tracing::error!(event = "api_error", error = %err, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new(err.to_string()).into_value(),
            )
        }
    }
}

fn bad_request(msg: &str) -> (StatusCode, Value) {
    (StatusCode::BAD_REQUEST, ErrorResponse::new(msg).into_value())
}

fn serialized<T: Serialize>(status: StatusCode, value: &T) -> (StatusCode, Value) {
    match serde_json::to_value(value) {
        Ok(body) => (status, body),
        Err(e) => error_response(&GraphError::Json(e)),
    }
}

fn reply(pair: (StatusCode, Value)) -> (StatusCode, Reply) {
    (pair.0, Reply::Json(pair.1))
}

/// `a, b,,c` -> `["a", "b", "c"]`; `None` when nothing is left.
pub fn split_list(raw: Option<&str>) -> Option<Vec<String>> {
    let items: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn parse_direction(raw: Option<&str>) -> Result<Direction, GraphError> {
    raw.unwrap_or("both").parse()
}

fn parse_format(raw: Option<&str>) -> Result<ContextFormat, GraphError> {
    raw.unwrap_or("json").parse()
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Health probe: a stats call against the configured backend.
pub async fn health_inner(state: &HttpState) -> (StatusCode, Value) {
    match state.backend().get_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            json!({
                "status": "healthy",
                "service": "strata",
                "version": env!("CARGO_PKG_VERSION"),
                "backend": stats.storage_backend,
                "node_count": stats.total_nodes,
            }),
        ),
        Err(e) => {
            tracing::warn!(event = "health_failed", error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "status": "unhealthy",
                    "service": "strata",
                    "error": e.to_string(),
                }),
            )
        }
    }
}

/// Inner version (pure, no IO).
pub fn version_inner() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "strata/1",
    })
}

// --- Nodes ------------------------------------------------------------------

pub async fn create_node_inner(state: &HttpState, req: CreateNodeRequest) -> (StatusCode, Value) {
    let node_type = match req.node_type.filter(|t| !t.trim().is_empty()) {
        Some(t) => t,
        None => return bad_request("type is required"),
    };
    match state
        .graph()
        .create_node(&node_type, req.data, req.id.as_deref())
        .await
    {
        Ok(node) => (StatusCode::CREATED, json!({ "node": node })),
        Err(e) => error_response(&e),
    }
}

pub async fn list_nodes_inner(state: &HttpState, params: ListNodesParams) -> (StatusCode, Value) {
    let mut query = NodeQuery {
        node_type: params.node_type.filter(|t| !t.is_empty()),
        ..NodeQuery::default()
    };
    if let Some(limit) = params.limit {
        query.limit = limit;
    }
    query.offset = params.offset.unwrap_or(0);
    for (key, value) in [
        ("status", params.status),
        ("priority", params.priority),
        ("assignee", params.assignee),
    ] {
        if let Some(value) = value {
            query.filters.insert(key.to_string(), Value::String(value));
        }
    }
    paged_query(state, query).await
}

pub async fn query_nodes_inner(state: &HttpState, query: NodeQuery) -> (StatusCode, Value) {
    paged_query(state, query).await
}

async fn paged_query(state: &HttpState, query: NodeQuery) -> (StatusCode, Value) {
    let graph = state.graph();
    let filters = (!query.filters.is_empty()).then_some(&query.filters);
    let nodes = match graph.query_nodes(&query).await {
        Ok(nodes) => nodes,
        Err(e) => return error_response(&e),
    };
    let total = match graph.count_nodes(query.node_type.as_deref(), filters).await {
        Ok(total) => total,
        Err(e) => return error_response(&e),
    };
    (
        StatusCode::OK,
        json!({
            "total": total,
            "count": nodes.len(),
            "limit": query.limit,
            "offset": query.offset,
            "nodes": nodes,
        }),
    )
}

pub async fn get_node_inner(state: &HttpState, node_id: &str) -> (StatusCode, Value) {
    match state.graph().get_node(node_id).await {
        Ok(Some(node)) => (StatusCode::OK, json!({ "node": node })),
        Ok(None) => error_response(&GraphError::node_not_found(node_id)),
        Err(e) => error_response(&e),
    }
}

pub async fn update_node_inner(state: &HttpState, node_id: &str, req: UpdateNodeRequest) -> (StatusCode, Value) {
    match state.graph().update_node(node_id, req.data, req.merge).await {
        Ok(node) => {
            tracing::info!(event = "node_updated", node_id = %node_id, merge = req.merge, "Node updated");
            (StatusCode::OK, json!({ "node": node }))
        }
        Err(e) => error_response(&e),
    }
}

pub async fn delete_node_inner(state: &HttpState, node_id: &str) -> (StatusCode, Value) {
    match state.graph().delete_node(node_id).await {
        Ok(true) => (StatusCode::OK, json!({"success": true, "node_id": node_id})),
        Ok(false) => error_response(&GraphError::node_not_found(node_id)),
        Err(e) => error_response(&e),
    }
}

pub async fn node_edges_inner(state: &HttpState, node_id: &str, params: EdgeParams) -> (StatusCode, Value) {
    let direction = match parse_direction(params.direction.as_deref()) {
        Ok(d) => d,
        Err(e) => return error_response(&e),
    };
    match state
        .graph()
        .get_edges(node_id, direction, params.relation.as_deref())
        .await
    {
        Ok(edges) => (StatusCode::OK, json!({"count": edges.len(), "edges": edges})),
        Err(e) => error_response(&e),
    }
}

pub async fn related_nodes_inner(state: &HttpState, node_id: &str, params: EdgeParams) -> (StatusCode, Value) {
    let direction = match parse_direction(params.direction.as_deref()) {
        Ok(d) => d,
        Err(e) => return error_response(&e),
    };
    match state
        .graph()
        .get_related_nodes(node_id, params.relation.as_deref(), direction)
        .await
    {
        Ok(nodes) => (StatusCode::OK, json!({"count": nodes.len(), "nodes": nodes})),
        Err(e) => error_response(&e),
    }
}

// --- Edges ------------------------------------------------------------------

pub async fn create_edge_inner(state: &HttpState, req: CreateEdgeRequest) -> (StatusCode, Value) {
    let (from_id, relation, to_id) = match (req.from_id, req.relation, req.to_id) {
        (Some(f), Some(r), Some(t)) if !f.is_empty() && !r.is_empty() && !t.is_empty() => (f, r, t),
        _ => return bad_request("Required fields: from_id, relation, to_id"),
    };
    match state.graph().create_edge(&from_id, &relation, &to_id, req.data).await {
        Ok(edge) => (StatusCode::CREATED, json!({ "edge": edge })),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_edge_inner(state: &HttpState, edge_id: &str) -> (StatusCode, Value) {
    match state.graph().delete_edge(edge_id).await {
        Ok(true) => (StatusCode::OK, json!({"success": true, "edge_id": edge_id})),
        Ok(false) => error_response(&GraphError::edge_not_found(edge_id)),
        Err(e) => error_response(&e),
    }
}

// --- Search and traversal ---------------------------------------------------

pub async fn search_inner(state: &HttpState, params: SearchParams) -> (StatusCode, Value) {
    let query = match params.q {
        Some(q) if !q.trim().is_empty() => q,
        _ => return bad_request("q parameter required"),
    };
    let start = Instant::now();
    let fields = split_list(params.fields.as_deref());
    let result = state
        .graph()
        .search_nodes(
            &query,
            params.node_type.as_deref().filter(|t| !t.is_empty()),
            fields.as_deref(),
            params.limit.unwrap_or(50),
        )
        .await;
    match result {
        Ok(nodes) => (
            StatusCode::OK,
            json!({
                "count": nodes.len(),
                "nodes": nodes,
                "took_ms": start.elapsed().as_millis() as u64,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn traverse_inner(state: &HttpState, node_id: &str, params: TraverseParams) -> (StatusCode, Value) {
    let direction = match parse_direction(params.direction.as_deref()) {
        Ok(d) => d,
        Err(e) => return error_response(&e),
    };
    let relations = split_list(params.relations.as_deref());
    let depth = params.depth.unwrap_or(state.config.retrieval.default_depth);
    match state
        .graph()
        .traverse(node_id, depth, relations.as_deref(), direction)
        .await
    {
        Ok(traversal) => serialized(StatusCode::OK, &traversal),
        Err(e) => error_response(&e),
    }
}

// --- Retrieval --------------------------------------------------------------

pub async fn subgraph_inner(state: &HttpState, node_id: &str, params: SubgraphParams) -> (StatusCode, Reply) {
    let format = match parse_format(params.format.as_deref()) {
        Ok(f) => f,
        Err(e) => return reply(error_response(&e)),
    };
    let limits = &state.config.retrieval;
    let types = split_list(params.types.as_deref());
    let context = match state
        .retrieval()
        .extract_subgraph(
            node_id,
            params.depth.unwrap_or(limits.default_depth),
            types.as_deref(),
            params.max_nodes.unwrap_or(limits.max_nodes),
        )
        .await
    {
        Ok(ctx) => ctx,
        Err(e) => return reply(error_response(&e)),
    };
    render(&context, format, params.max_tokens.unwrap_or(limits.max_tokens))
}

/// JSON contexts are returned whole; text formats go through the prompt renderer.
fn render(
    context: &GraphContext,
    format: ContextFormat,
    max_tokens: usize,
) -> (StatusCode, Reply) {
    if !format.is_text() {
        return reply(serialized(StatusCode::OK, context));
    }
    match format_for_llm(context, format, max_tokens) {
        Ok(text) => (StatusCode::OK, Reply::Text(text)),
        Err(e) => reply(error_response(&e)),
    }
}

pub async fn paths_inner(state: &HttpState, params: PathsParams) -> (StatusCode, Value) {
    let (from, to) = match (params.from, params.to) {
        (Some(f), Some(t)) if !f.is_empty() && !t.is_empty() => (f, t),
        _ => return bad_request("from and to parameters required"),
    };
    match state
        .retrieval()
        .find_connecting_paths(&from, &to, params.max_depth.unwrap_or(4))
        .await
    {
        Ok(paths) => (
            StatusCode::OK,
            json!({"from": from, "to": to, "count": paths.len(), "paths": paths}),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn path_context_inner(state: &HttpState, req: PathContextRequest) -> (StatusCode, Value) {
    if req.node_ids.len() < 2 {
        return bad_request("At least 2 node_ids required");
    }
    let result = state
        .retrieval()
        .extract_paths(
            &req.node_ids,
            req.max_depth.unwrap_or(3),
            req.relations.as_deref(),
            req.max_paths.unwrap_or(state.config.retrieval.max_paths),
        )
        .await;
    match result {
        Ok(ctx) => serialized(StatusCode::OK, &ctx),
        Err(e) => error_response(&e),
    }
}

pub async fn entity_context_inner(state: &HttpState, req: EntityContextRequest) -> (StatusCode, Value) {
    if req.entity_ids.is_empty() {
        return bad_request("entity_ids required");
    }
    let result = state
        .retrieval()
        .extract_entity_context(&req.entity_ids, req.include_relations, req.depth.unwrap_or(1))
        .await;
    match result {
        Ok(ctx) => serialized(StatusCode::OK, &ctx),
        Err(e) => error_response(&e),
    }
}

pub async fn relation_context_inner(state: &HttpState, req: RelationContextRequest) -> (StatusCode, Value) {
    if req.relation_types.is_empty() {
        return bad_request("relation_types required");
    }
    let limit = req.limit.unwrap_or(state.config.retrieval.relation_limit);
    match state
        .retrieval()
        .extract_relation_context(&req.relation_types, limit)
        .await
    {
        Ok(ctx) => serialized(StatusCode::OK, &ctx),
        Err(e) => error_response(&e),
    }
}

pub async fn hybrid_context_inner(state: &HttpState, req: HybridRequest) -> (StatusCode, Value) {
    match state.retrieval().extract_hybrid_context(&req).await {
        Ok(ctx) => serialized(StatusCode::OK, &ctx),
        Err(e) => error_response(&e),
    }
}

pub async fn multi_context_inner(state: &HttpState, req: MultiContextRequest) -> (StatusCode, Value) {
    if req.node_ids.is_empty() {
        return bad_request("node_ids required");
    }
    let depth = req.depth.unwrap_or(1);
    match state
        .retrieval()
        .extract_multi_focal(&req.node_ids, depth, req.types.as_deref())
        .await
    {
        Ok(ctx) => serialized(StatusCode::OK, &ctx),
        Err(e) => error_response(&e),
    }
}

pub async fn query_context_inner(state: &HttpState, req: QueryContextRequest) -> (StatusCode, Reply) {
    let query = match req.query {
        Some(q) if !q.trim().is_empty() => q,
        _ => return reply(bad_request("query required")),
    };
    let mode = match req.mode.as_deref().unwrap_or("auto").parse::<RetrievalMode>() {
        Ok(m) => m,
        Err(e) => return reply(error_response(&e)),
    };
    let format = match parse_format(req.format.as_deref()) {
        Ok(f) => f,
        Err(e) => return reply(error_response(&e)),
    };

    let start = Instant::now();
    let context = match state
        .retrieval()
        .retrieve_for_query(&query, mode, req.max_nodes.unwrap_or(50))
        .await
    {
        Ok(ctx) => ctx,
        Err(e) => return reply(error_response(&e)),
    };
    tracing::info!(
        event = "context_query",
        mode = %mode,
        format = %format,
        node_count = context.graph.len(),
        took_ms = start.elapsed().as_millis() as u64,
        "Query context retrieved"
    );
    render(
        &context,
        format,
        req.max_tokens.unwrap_or(state.config.retrieval.max_tokens),
    )
}

// --- Bulk and import --------------------------------------------------------

pub async fn bulk_nodes_inner(state: &HttpState, req: BulkNodesRequest) -> (StatusCode, Value) {
    if req.nodes.is_empty() {
        return bad_request("nodes array required");
    }
    let specs: Vec<NodeSpec> = req
        .nodes
        .into_iter()
        .filter_map(|row| serde_json::from_value(row).ok())
        .collect();
    match state.graph().bulk_create_nodes(specs).await {
        Ok(created) => (
            StatusCode::CREATED,
            json!({"created_count": created.len(), "nodes": created}),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn bulk_edges_inner(state: &HttpState, req: BulkEdgesRequest) -> (StatusCode, Value) {
    if req.edges.is_empty() {
        return bad_request("edges array required");
    }
    let specs: Vec<EdgeSpec> = req
        .edges
        .into_iter()
        .filter_map(|row| serde_json::from_value(row).ok())
        .collect();
    match state.graph().bulk_create_edges(specs).await {
        Ok(created) => (
            StatusCode::CREATED,
            json!({"created_count": created.len(), "edges": created}),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn import_inner(state: &HttpState, req: ImportRequest) -> (StatusCode, Value) {
    let source = match req.source.as_deref().unwrap_or("").parse::<ImportSource>() {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    match run_import(&state.graph(), state.store.as_ref(), source, &req.options).await {
        Ok(report) => serialized(StatusCode::OK, &report),
        Err(e) => anyhow_response(&e),
    }
}

// --- Meta and domain helpers ------------------------------------------------

pub async fn schema_inner(state: &HttpState) -> (StatusCode, Value) {
    match state.graph().get_schema().await {
        Ok(schema) => serialized(StatusCode::OK, &schema),
        Err(e) => error_response(&e),
    }
}

pub async fn stats_inner(state: &HttpState) -> (StatusCode, Value) {
    match state.graph().get_stats().await {
        Ok(stats) => serialized(StatusCode::OK, &stats),
        Err(e) => error_response(&e),
    }
}

pub async fn topic_tree_inner(state: &HttpState, params: TopicTreeParams) -> (StatusCode, Value) {
    let root = params.root.filter(|r| !r.is_empty());
    match state.graph().get_topic_hierarchy(root.as_deref()).await {
        Ok(tree) => (StatusCode::OK, json!({ "topics": tree })),
        Err(e) => error_response(&e),
    }
}

pub async fn topic_tasks_inner(state: &HttpState, topic_id: &str) -> (StatusCode, Value) {
    match state.graph().get_tasks_by_topic(topic_id).await {
        Ok(tasks) => (
            StatusCode::OK,
            json!({"topic_id": topic_id, "count": tasks.len(), "tasks": tasks}),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn tasks_inner(state: &HttpState, params: TasksParams) -> (StatusCode, Value) {
    let status = params
        .status
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "pending".to_string());
    match state.graph().get_tasks_by_status(&status).await {
        Ok(tasks) => (
            StatusCode::OK,
            json!({"status": status, "count": tasks.len(), "tasks": tasks}),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn goal_alignment_inner(state: &HttpState, goal_id: &str) -> (StatusCode, Value) {
    match state.graph().get_goal_alignment(goal_id).await {
        Ok(alignment) => serialized(StatusCode::OK, &alignment),
        Err(e) => error_response(&e),
    }
}

pub async fn taxonomy_inner(state: &HttpState) -> (StatusCode, Value) {
    let snapshot = state.taxonomy.get().await;
    serialized(StatusCode::OK, snapshot.as_ref())
}

pub async fn taxonomy_refresh_inner(state: &HttpState) -> (StatusCode, Value) {
    let snapshot = state.taxonomy.refresh().await;
    tracing::info!(
        event = "taxonomy_refreshed",
        object = %snapshot.object,
        topic_count = snapshot.taxonomy.topics.len(),
        "Topic taxonomy refreshed"
    );
    serialized(StatusCode::OK, snapshot.as_ref())
}

pub async fn repair_inner(state: &HttpState) -> (StatusCode, Value) {
    match state.graph().repair().await {
        Ok(report) => serialized(StatusCode::OK, &report),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

type Shared = State<Arc<HttpState>>;

pub async fn health_handler(State(state): Shared) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn create_node_handler(State(state): Shared, Json(req): Json<CreateNodeRequest>) -> impl IntoResponse {
    let (status, body) = create_node_inner(&state, req).await;
    (status, Json(body))
}

pub async fn list_nodes_handler(State(state): Shared, Query(params): Query<ListNodesParams>) -> impl IntoResponse {
    let (status, body) = list_nodes_inner(&state, params).await;
    (status, Json(body))
}

pub async fn query_nodes_handler(State(state): Shared, Json(query): Json<NodeQuery>) -> impl IntoResponse {
    let (status, body) = query_nodes_inner(&state, query).await;
    (status, Json(body))
}

pub async fn get_node_handler(State(state): Shared, Path(id): Path<String>) -> impl IntoResponse {
    let (status, body) = get_node_inner(&state, &id).await;
    (status, Json(body))
}

pub async fn update_node_handler(
    State(state): Shared,
    Path(id): Path<String>,
    Json(req): Json<UpdateNodeRequest>,
) -> impl IntoResponse {
    let (status, body) = update_node_inner(&state, &id, req).await;
    (status, Json(body))
}

pub async fn delete_node_handler(State(state): Shared, Path(id): Path<String>) -> impl IntoResponse {
    let (status, body) = delete_node_inner(&state, &id).await;
    (status, Json(body))
}

pub async fn node_edges_handler(
    State(state): Shared,
    Path(id): Path<String>,
    Query(params): Query<EdgeParams>,
) -> impl IntoResponse {
    let (status, body) = node_edges_inner(&state, &id, params).await;
    (status, Json(body))
}

pub async fn related_nodes_handler(
    State(state): Shared,
    Path(id): Path<String>,
    Query(params): Query<EdgeParams>,
) -> impl IntoResponse {
    let (status, body) = related_nodes_inner(&state, &id, params).await;
    (status, Json(body))
}

pub async fn create_edge_handler(State(state): Shared, Json(req): Json<CreateEdgeRequest>) -> impl IntoResponse {
    let (status, body) = create_edge_inner(&state, req).await;
    (status, Json(body))
}

pub async fn delete_edge_handler(State(state): Shared, Path(id): Path<String>) -> impl IntoResponse {
    let (status, body) = delete_edge_inner(&state, &id).await;
    (status, Json(body))
}

pub async fn search_handler(State(state): Shared, Query(params): Query<SearchParams>) -> impl IntoResponse {
    let (status, body) = search_inner(&state, params).await;
    (status, Json(body))
}

pub async fn traverse_handler(
    State(state): Shared,
    Path(id): Path<String>,
    Query(params): Query<TraverseParams>,
) -> impl IntoResponse {
    let (status, body) = traverse_inner(&state, &id, params).await;
    (status, Json(body))
}

pub async fn subgraph_handler(
    State(state): Shared,
    Path(id): Path<String>,
    Query(params): Query<SubgraphParams>,
) -> impl IntoResponse {
    subgraph_inner(&state, &id, params).await
}

pub async fn paths_handler(State(state): Shared, Query(params): Query<PathsParams>) -> impl IntoResponse {
    let (status, body) = paths_inner(&state, params).await;
    (status, Json(body))
}

pub async fn path_context_handler(State(state): Shared, Json(req): Json<PathContextRequest>) -> impl IntoResponse {
    let (status, body) = path_context_inner(&state, req).await;
    (status, Json(body))
}

pub async fn entity_context_handler(
    State(state): Shared,
    Json(req): Json<EntityContextRequest>,
) -> impl IntoResponse {
    let (status, body) = entity_context_inner(&state, req).await;
    (status, Json(body))
}

pub async fn relation_context_handler(
    State(state): Shared,
    Json(req): Json<RelationContextRequest>,
) -> impl IntoResponse {
    let (status, body) = relation_context_inner(&state, req).await;
    (status, Json(body))
}

pub async fn hybrid_context_handler(State(state): Shared, Json(req): Json<HybridRequest>) -> impl IntoResponse {
    let (status, body) = hybrid_context_inner(&state, req).await;
    (status, Json(body))
}

pub async fn multi_context_handler(State(state): Shared, Json(req): Json<MultiContextRequest>) -> impl IntoResponse {
    let (status, body) = multi_context_inner(&state, req).await;
    (status, Json(body))
}

pub async fn query_context_handler(State(state): Shared, Json(req): Json<QueryContextRequest>) -> impl IntoResponse {
    query_context_inner(&state, req).await
}

pub async fn bulk_nodes_handler(State(state): Shared, Json(req): Json<BulkNodesRequest>) -> impl IntoResponse {
    let (status, body) = bulk_nodes_inner(&state, req).await;
    (status, Json(body))
}

pub async fn bulk_edges_handler(State(state): Shared, Json(req): Json<BulkEdgesRequest>) -> impl IntoResponse {
    let (status, body) = bulk_edges_inner(&state, req).await;
    (status, Json(body))
}

pub async fn import_handler(State(state): Shared, Json(req): Json<ImportRequest>) -> impl IntoResponse {
    let (status, body) = import_inner(&state, req).await;
    (status, Json(body))
}

pub async fn schema_handler(State(state): Shared) -> impl IntoResponse {
    let (status, body) = schema_inner(&state).await;
    (status, Json(body))
}

pub async fn stats_handler(State(state): Shared) -> impl IntoResponse {
    let (status, body) = stats_inner(&state).await;
    (status, Json(body))
}

pub async fn topic_tree_handler(State(state): Shared, Query(params): Query<TopicTreeParams>) -> impl IntoResponse {
    let (status, body) = topic_tree_inner(&state, params).await;
    (status, Json(body))
}

pub async fn topic_tasks_handler(State(state): Shared, Path(id): Path<String>) -> impl IntoResponse {
    let (status, body) = topic_tasks_inner(&state, &id).await;
    (status, Json(body))
}

pub async fn tasks_handler(State(state): Shared, Query(params): Query<TasksParams>) -> impl IntoResponse {
    let (status, body) = tasks_inner(&state, params).await;
    (status, Json(body))
}

pub async fn goal_alignment_handler(State(state): Shared, Path(id): Path<String>) -> impl IntoResponse {
    let (status, body) = goal_alignment_inner(&state, &id).await;
    (status, Json(body))
}

pub async fn taxonomy_handler(State(state): Shared) -> impl IntoResponse {
    let (status, body) = taxonomy_inner(&state).await;
    (status, Json(body))
}

pub async fn taxonomy_refresh_handler(State(state): Shared) -> impl IntoResponse {
    let (status, body) = taxonomy_refresh_inner(&state).await;
    (status, Json(body))
}

pub async fn repair_handler(State(state): Shared) -> impl IntoResponse {
    let (status, body) = repair_inner(&state).await;
    (status, Json(body))
}

pub async fn fallback_handler(method: Method, uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not found",
            "status": "error",
            "path": uri.path(),
            "method": method.as_str(),
        })),
    )
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_state() -> HttpState {
        HttpState::from_config(StrataConfig::in_memory())
            .await
            .expect("in-memory state")
    }

    // ========================================================================
    // TEST 1: version_inner is pure and returns correct fields
    // ========================================================================
    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string(), "version must be string");
        assert_eq!(v["protocol"], "strata/1");
    }

    // ========================================================================
    // TEST 2: error mapping follows the error kind
    // ========================================================================
    #[test]
    fn test_status_for_error_kinds() {
        assert_eq!(status_for(&GraphError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&GraphError::node_not_found("a")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&GraphError::AlreadyExists("a".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&GraphError::Conflict { path: "graph/index.json".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&GraphError::storage("graph/x", "boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let (status, body) = error_response(&GraphError::Validation("bad depth".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("bad depth"));
    }

    #[test]
    fn test_anyhow_response_downcasts_graph_errors() {
        let err = anyhow::Error::new(GraphError::NotFound {
            kind: "Object",
            id: "tasks/consolidated_tasks.json".into(),
        });
        assert_eq!(anyhow_response(&err).0, StatusCode::NOT_FOUND);

        let other = anyhow::anyhow!("something else");
        assert_eq!(anyhow_response(&other).0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // ========================================================================
    // TEST 3: split_list trims and drops empties
    // ========================================================================
    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(Some("hasTopic, dependsOn,,")),
            Some(vec!["hasTopic".to_string(), "dependsOn".to_string()])
        );
        assert_eq!(split_list(Some(" , ")), None);
        assert_eq!(split_list(None), None);
    }

    // ========================================================================
    // TEST 4: health on an empty in-memory graph
    // ========================================================================
    #[tokio::test]
    async fn test_health_inner_empty_graph() {
        let state = make_state().await;
        let (status, body) = health_inner(&state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["node_count"], 0);
    }

    // ========================================================================
    // TEST 5: node validation errors are 400
    // ========================================================================
    #[tokio::test]
    async fn test_create_node_requires_type() {
        let state = make_state().await;
        let (status, body) = create_node_inner(&state, CreateNodeRequest::default()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "type is required");
    }

    #[tokio::test]
    async fn test_create_edge_requires_all_fields() {
        let state = make_state().await;
        let req = CreateEdgeRequest {
            from_id: Some("task:1".into()),
            relation: Some("hasTopic".into()),
            ..CreateEdgeRequest::default()
        };
        let (status, _) = create_edge_inner(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // ========================================================================
    // TEST 6: node lifecycle through the inner functions
    // ========================================================================
    #[tokio::test]
    async fn test_node_lifecycle() {
        let state = make_state().await;
        let req = CreateNodeRequest {
            node_type: Some("Task".into()),
            id: Some("task:ship".into()),
            data: json!({"name": "Ship", "status": "pending"})
                .as_object()
                .cloned()
                .unwrap(),
        };
        let (status, body) = create_node_inner(&state, req).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["node"]["@id"], "task:ship");

        let dup = CreateNodeRequest {
            node_type: Some("Task".into()),
            id: Some("task:ship".into()),
            data: Map::new(),
        };
        assert_eq!(create_node_inner(&state, dup).await.0, StatusCode::CONFLICT);

        let update = UpdateNodeRequest {
            data: json!({"status": "done"}).as_object().cloned().unwrap(),
            merge: true,
        };
        let (status, body) = update_node_inner(&state, "task:ship", update).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node"]["name"], "Ship");
        assert_eq!(body["node"]["status"], "done");

        let (status, body) = delete_node_inner(&state, "task:ship").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        assert_eq!(get_node_inner(&state, "task:ship").await.0, StatusCode::NOT_FOUND);
        assert_eq!(delete_node_inner(&state, "task:ship").await.0, StatusCode::NOT_FOUND);
    }

    // ========================================================================
    // TEST 7: bad format and mode values are rejected before any IO
    // ========================================================================
    #[tokio::test]
    async fn test_query_context_rejects_bad_format() {
        let state = make_state().await;
        let req = QueryContextRequest {
            query: Some("what blocks the launch".into()),
            format: Some("yaml".into()),
            ..QueryContextRequest::default()
        };
        let (status, body) = query_context_inner(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(body, Reply::Json(_)));

        let req = QueryContextRequest {
            query: Some("anything".into()),
            mode: Some("psychic".into()),
            ..QueryContextRequest::default()
        };
        assert_eq!(query_context_inner(&state, req).await.0, StatusCode::BAD_REQUEST);

        let (status, _) = query_context_inner(&state, QueryContextRequest::default()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // ========================================================================
    // TEST 8: import with an unknown source is a 400, a missing object a 404
    // ========================================================================
    #[tokio::test]
    async fn test_import_inner_errors() {
        let state = make_state().await;
        let req = ImportRequest {
            source: Some("spreadsheets".into()),
            options: ImportOptions::default(),
        };
        let (status, body) = import_inner(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "Validation error: source must be 'consolidated_tasks' or 'topic_taxonomy'"
        );

        let req = ImportRequest {
            source: Some("consolidated_tasks".into()),
            options: ImportOptions::default(),
        };
        assert_eq!(import_inner(&state, req).await.0, StatusCode::NOT_FOUND);
    }
}
