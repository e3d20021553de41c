//! HTTP surface (C18).
//!
//! Exposes the platform's search, RAG query, and agent-management
//! operations as a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/search` | Dense, sparse, or hybrid search over the vector store |
//! | `POST` | `/v1/query` | Full RAG pipeline: retrieve, prompt, generate |
//! | `GET`  | `/v1/sources` | List configured source agents and their state |
//! | `POST` | `/v1/agents` | Register a new source agent |
//! | `GET`  | `/v1/agents` | List every registered agent |
//! | `POST` | `/v1/agents/{id}/run` | Run one agent's ingest pipeline immediately |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes mirror [`crate::error::RagError::code`] plus the
//! `bad_request` catch-all for request validation failures.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support
//! browser-based clients and cross-origin tool calls.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::RagError;
use crate::ingestion::IngestionManager;
use crate::models::{AgentConfig, AgentRun, SearchResult};
use crate::rag::{QueryOptions, RagAnswer, RagOrchestrator};
use crate::retriever::HybridWeights;
use crate::store::VectorStore;

/// Shared application state passed to all route handlers via Axum's
/// `State` extractor.
#[derive(Clone)]
struct AppState {
    store: Arc<VectorStore>,
    orchestrator: Arc<RagOrchestrator>,
    ingestion: Arc<IngestionManager>,
}

/// Starts the HTTP surface, binding to `[server].bind` and registering
/// every route handler. Runs until the process is terminated.
fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/v1/search", post(handle_search))
        .route("/v1/query", post(handle_query))
        .route("/v1/sources", get(handle_sources))
        .route("/v1/agents", post(handle_add_agent).get(handle_list_agents))
        .route("/v1/agents/{id}/run", post(handle_run_agent))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(config: &Config, store: Arc<VectorStore>, orchestrator: Arc<RagOrchestrator>, ingestion: Arc<IngestionManager>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = build_router(AppState { store, orchestrator, ingestion });

    println!("ragctl server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Maps the full [`RagError`] taxonomy onto an HTTP status, keeping the
/// `{code,message}` shape the teacher's four-code server used, now
/// driven by `RagError::code()` instead of a hand-maintained match.
fn from_rag_error(err: RagError) -> AppError {
    let status = match &err {
        RagError::NotFound(_) | RagError::ModelNotFound(_) | RagError::CollectionMissing(_) => StatusCode::NOT_FOUND,
        RagError::ConfigInvalid(_) | RagError::ScheduleInvalid(_) | RagError::TemplateInvalid(_) | RagError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
        RagError::ProviderAuth(_) | RagError::SourceAuth(_) => StatusCode::UNAUTHORIZED,
        RagError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        RagError::AlreadyRunning(_) => StatusCode::CONFLICT,
        RagError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RagError::RemoteUnavailable(_) | RagError::Transient(_) | RagError::Transport(_) => StatusCode::BAD_GATEWAY,
        RagError::MissingDependency(_) => StatusCode::SERVICE_UNAVAILABLE,
        RagError::IndexCorrupt(_) | RagError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    };
    AppError {
        status,
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

// ============ POST /v1/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(default)]
    filter: Option<Value>,
    #[serde(default)]
    embedding_model: Option<String>,
}

fn default_mode() -> String {
    "hybrid".to_string()
}

fn default_search_limit() -> usize {
    12
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

async fn handle_search(State(state): State<AppState>, Json(req): Json<SearchRequest>) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let results = match req.mode.as_str() {
        "keyword" => state.store.metadata_search(req.filter.as_ref().unwrap_or(&Value::Object(Default::default())), req.limit).await,
        "semantic" => state
            .store
            .search_by_text(&req.query, req.limit, req.filter.as_ref(), None, req.embedding_model.as_deref())
            .await
            .map_err(from_rag_error)?,
        "hybrid" => state
            .store
            .hybrid_search(&req.query, req.limit, req.filter.as_ref(), None, req.embedding_model.as_deref(), HybridWeights::default())
            .await
            .map_err(from_rag_error)?,
        other => return Err(bad_request(format!("unknown search mode: {other}. Use keyword, semantic, or hybrid."))),
    };

    Ok(Json(SearchResponse { results }))
}

// ============ POST /v1/query ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default = "default_context_limit")]
    context_limit: usize,
    #[serde(default)]
    include_sources: bool,
    #[serde(default)]
    llm_model: Option<String>,
    #[serde(default)]
    embedding_model: Option<String>,
}

fn default_context_limit() -> usize {
    5
}

async fn handle_query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Result<Json<RagAnswer>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let options = QueryOptions {
        include_sources: req.include_sources,
        llm_model: req.llm_model.as_deref(),
        embedding_model: req.embedding_model.as_deref(),
        ..Default::default()
    };

    let answer = state.orchestrator.query(&req.question, req.context_limit, options).await.map_err(from_rag_error)?;

    Ok(Json(answer))
}

// ============ GET /v1/sources ============

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<AgentConfig>,
}

async fn handle_sources(State(state): State<AppState>) -> Json<SourcesResponse> {
    Json(SourcesResponse {
        sources: state.ingestion.list_agents().await,
    })
}

// ============ POST/GET /v1/agents ============

#[derive(Serialize)]
struct AgentsResponse {
    agents: Vec<AgentConfig>,
}

async fn handle_list_agents(State(state): State<AppState>) -> Json<AgentsResponse> {
    Json(AgentsResponse {
        agents: state.ingestion.list_agents().await,
    })
}

async fn handle_add_agent(State(state): State<AppState>, Json(config): Json<AgentConfig>) -> Result<Json<AgentConfig>, AppError> {
    state.ingestion.add_agent(config.clone()).await.map_err(from_rag_error)?;
    Ok(Json(config))
}

// ============ POST /v1/agents/{id}/run ============

async fn handle_run_agent(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Result<Json<AgentRun>, AppError> {
    let run = state.ingestion.run_agent(&id).await.map_err(from_rag_error)?;
    Ok(Json(run))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::CustomAgentRegistry;
    use crate::cache::{CacheConfig, EmbeddingCache};
    use crate::chunk::ChunkingConfig;
    use crate::index::IndexType;
    use crate::metric::Metric;
    use crate::models::{EmbeddingModelConfig, EmbeddingProviderKind, IndexBackendParams};
    use crate::rag::StubGenerator;
    use crate::store::ShardConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let model = EmbeddingModelConfig {
            id: "m1".into(),
            provider: EmbeddingProviderKind::LocalHttp,
            remote_model_id: None,
            dimensions: 2,
            api_key_env: None,
            api_base_url: Some("http://localhost:0/unused".into()),
            options: Default::default(),
            batch_size: 8,
            normalize: false,
            cache_enabled: false,
            timeout_secs: 5,
            rate_limit_rpm: 1000,
        };
        let embeddings = Arc::new(crate::embedding::EmbeddingService::new(vec![model], "m1".to_string(), cache).unwrap());
        let shard = ShardConfig {
            model_id: "m1".into(),
            index_type: IndexType::Hnsw,
            metric: Metric::Cosine,
            dimensions: 2,
            params: IndexBackendParams::default(),
        };
        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::new(vec![shard], "m1".to_string(), store_dir.path().to_path_buf(), embeddings).unwrap());
        let orchestrator = Arc::new(RagOrchestrator::new(store.clone(), Arc::new(StubGenerator::new()), Vec::new()));
        let agents_dir = tempfile::tempdir().unwrap();
        let ingestion = Arc::new(IngestionManager::load(agents_dir.path().to_path_buf(), store.clone(), ChunkingConfig::default(), CustomAgentRegistry::new()).await.unwrap());
        AppState { store, orchestrator, ingestion }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_router(test_state().await);
        let response = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn search_rejects_empty_query() {
        let app = build_router(test_state().await);
        let body = serde_json::json!({"query": "  "}).to_string();
        let response = app
            .oneshot(Request::builder().method("POST").uri("/v1/search").header("content-type", "application/json").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn query_rejects_empty_question() {
        let app = build_router(test_state().await);
        let body = serde_json::json!({"question": ""}).to_string();
        let response = app
            .oneshot(Request::builder().method("POST").uri("/v1/query").header("content-type", "application/json").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_agent_on_unknown_id_is_not_found() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(Request::builder().method("POST").uri("/v1/agents/does-not-exist/run").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sources_lists_registered_agents() {
        let state = test_state().await;
        state
            .ingestion
            .add_agent(crate::models::AgentConfig::new(crate::models::AgentType::Filesystem, "test-agent", "interval:1h"))
            .await
            .unwrap();
        let app = build_router(state);
        let response = app.oneshot(Request::builder().uri("/v1/sources").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
