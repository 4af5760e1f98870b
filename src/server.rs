//! HTTP server.
//!
//! Exposes ingestion, chat, and index management over a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `GET`    | `/health` | 200 when the generation model is loaded, 503 otherwise |
//! | `GET`    | `/api/config` | Backend name and configured models |
//! | `POST`   | `/api/documents?session_id=..&filename=..` | Ingest raw document bytes |
//! | `GET`    | `/api/documents[?session_id=..]` | List indexed documents, optionally those uploaded in one session |
//! | `DELETE` | `/api/documents/{id}` | Remove a document (index rebuild) |
//! | `POST`   | `/api/chat` | Ask a question within a session |
//! | `POST`   | `/api/sessions/{id}/reset` | Drop a session and its history |
//! | `GET`    | `/metrics` | Prometheus text exposition |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "model_unavailable", "message": "...", "retryable": true } }
//! ```
//!
//! | Status | Codes |
//! |--------|-------|
//! | 400 | `bad_request` |
//! | 404 | `not_found` |
//! | 413 | `payload_too_large` |
//! | 415 | `unsupported_format` |
//! | 422 | `corrupt_document`, `empty_document`, `prompt_too_long` |
//! | 500 | `dimension_mismatch`, `index_corruption`, `storage_error`, `internal` |
//! | 503 | `index_busy`, `embedding_model_error`, `model_unavailable` |
//! | 504 | `generation_timeout` |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front-ends
//! served from another port can call the API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use local_rag_core::error::RagError;

use crate::config::Config;
use crate::pipeline::RagPipeline;
use crate::store::DocumentRecord;

const BACKEND_NAME: &str = "local-rag";
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<RagPipeline>,
}

/// Open the pipeline from `config` and serve on `[server].bind` until
/// Ctrl-C, then unload the model and close the index.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(RagPipeline::open(config).await?);
    let listener = TcpListener::bind(&config.server.bind).await?;
    println!("RAG server listening on http://{}", config.server.bind);

    let monitor = pipeline
        .metrics()
        .spawn_memory_monitor(MEMORY_SAMPLE_INTERVAL);
    let result = serve(listener, pipeline.clone()).await;
    monitor.abort();
    pipeline.shutdown().await;
    result
}

/// Serve an already-open pipeline on `listener` until Ctrl-C.
pub async fn serve(listener: TcpListener, pipeline: Arc<RagPipeline>) -> anyhow::Result<()> {
    let app = build_router(pipeline);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

/// Build the router over `pipeline`.
pub fn build_router(pipeline: Arc<RagPipeline>) -> Router {
    let max_upload = pipeline.config().server.max_upload_bytes;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/config", get(handle_config))
        .route(
            "/api/documents",
            post(handle_upload)
                .get(handle_list_documents)
                .layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/api/documents/{id}", delete(handle_delete_document))
        .route("/api/chat", post(handle_chat))
        .route("/api/sessions/{id}/reset", post(handle_reset_session))
        .route("/metrics", get(handle_metrics))
        .layer(cors)
        .with_state(AppState { pipeline })
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
    retryable: bool,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RagError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
            RagError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RagError::CorruptDocument(_)
            | RagError::EmptyDocument { .. }
            | RagError::PromptTooLong { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::IndexBusy { .. }
            | RagError::EmbeddingModel(_)
            | RagError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RagError::DimensionMismatch { .. }
            | RagError::IndexCorruption(_)
            | RagError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(code = err.error_code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        retryable: false,
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
        retryable: false,
    }
}

impl From<BytesRejection> for AppError {
    fn from(rejection: BytesRejection) -> Self {
        let status = rejection.status();
        let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
            "payload_too_large"
        } else {
            "bad_request"
        };
        AppError {
            status,
            code: code.to_string(),
            message: rejection.body_text(),
            retryable: false,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    if state.pipeline.models().generator().is_loaded() {
        (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
            }),
        )
    }
}

// ============ GET /api/config ============

#[derive(Serialize)]
struct ConfigResponse {
    backend_name: &'static str,
    version: &'static str,
    models: Vec<String>,
    embedding_model: String,
    dims: usize,
    top_k: usize,
    prompt_budget_tokens: usize,
}

async fn handle_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let pipeline = &state.pipeline;
    let config = pipeline.config();
    let embedder = pipeline.models().embedder();
    Json(ConfigResponse {
        backend_name: BACKEND_NAME,
        version: env!("CARGO_PKG_VERSION"),
        models: vec![pipeline.models().generator().model_name().to_string()],
        embedding_model: embedder.model_name().to_string(),
        dims: embedder.dims(),
        top_k: config.retrieval.top_k,
        prompt_budget_tokens: config.prompt.budget_tokens,
    })
}

// ============ /api/documents ============

#[derive(Deserialize)]
struct UploadParams {
    session_id: String,
    filename: String,
}

#[derive(Serialize)]
struct UploadResponse {
    document_id: String,
    filename: String,
    pages: usize,
    chunks: usize,
}

async fn handle_upload(
    State(state): State<AppState>,
    params: Result<Query<UploadParams>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let Query(params) =
        params.map_err(|e| bad_request(format!("session_id and filename are required: {}", e)))?;
    let bytes = body?;

    let report = state
        .pipeline
        .ingest(&params.session_id, &params.filename, bytes.to_vec())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            document_id: report.document_id,
            filename: report.filename,
            pages: report.pages,
            chunks: report.chunks,
        }),
    ))
}

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentRecord>,
}

#[derive(Deserialize)]
struct ListParams {
    session_id: Option<String>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let Query(params) = params.map_err(|e| bad_request(e.to_string()))?;
    let documents = match params.session_id {
        Some(session_id) => state.pipeline.session_documents(&session_id).await?,
        None => state.pipeline.documents().await?,
    };
    Ok(Json(DocumentListResponse { documents }))
}

#[derive(Serialize)]
struct DeleteResponse {
    document_id: String,
    removed_chunks: usize,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let removed = state.pipeline.delete_document(&id).await?;
    Ok(Json(DeleteResponse {
        document_id: id,
        removed_chunks: removed,
    }))
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    session_id: String,
    message: String,
}

#[derive(Serialize)]
struct PassageRef {
    chunk_id: String,
    document_id: String,
    score: f32,
    page_start: usize,
    page_end: usize,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    passages: Vec<PassageRef>,
}

async fn handle_chat(
    State(state): State<AppState>,
    request: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(request) = request.map_err(|e| bad_request(e.body_text()))?;
    let answer = state
        .pipeline
        .ask(&request.session_id, &request.message)
        .await?;

    let passages = answer
        .passages
        .into_iter()
        .map(|p| PassageRef {
            chunk_id: p.chunk_id,
            document_id: p.document_id,
            score: p.score,
            page_start: p.page_start,
            page_end: p.page_end,
        })
        .collect();
    Ok(Json(ChatResponse {
        response: answer.response,
        passages,
    }))
}

// ============ POST /api/sessions/{id}/reset ============

#[derive(Serialize)]
struct ResetResponse {
    session_id: String,
    reset: bool,
}

async fn handle_reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ResetResponse> {
    let reset = state.pipeline.reset_session(&id);
    Json(ResetResponse {
        session_id: id,
        reset,
    })
}

// ============ GET /metrics ============

async fn handle_metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let metrics = state.pipeline.metrics();
    let body = metrics.render().map_err(|e| internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, metrics.content_type())], body).into_response())
}
