//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Answer a question; `text/event-stream` of `token`, then `done` or `error` |
//! | `POST` | `/search` | Ranked knowledge chunks as JSON |
//! | `POST` | `/parse?file_name=…` | Parse the raw request body as a document |
//! | `GET`  | `/health` | Health check (returns version and chunk count) |
//!
//! # Error Contract
//!
//! Every error response before a stream starts has the shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500). Once a `/chat`
//! stream is open, failures arrive as an `error` event instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser widgets can
//! call the API directly.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::cartridge::{outline, OutlineItem};
use crate::config::{Config, RetrievalConfig};
use crate::extract::{self, DocumentKind, MAX_UPLOAD_BYTES};
use crate::index::RetrievalProfile;
use crate::models::{ChatMessage, ParseMetadata, ParsedContent, SearchResult, StreamEvent};
use crate::rag::{open_pipeline, PipelineError, RagPipeline};
use crate::search;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RagPipeline>,
    pub retrieval: RetrievalConfig,
}

/// Builds the router with CORS and the upload size limit applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/search", post(handle_search))
        .route("/parse", post(handle_parse))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

/// `crag serve`: opens the index, builds providers and serves until killed.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState {
        pipeline: Arc::new(open_pipeline(config).await?),
        retrieval: config.retrieval.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "server listening");
    println!("crag server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;

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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::EmptyQuery => bad_request("message must not be empty"),
            other => {
                error!(error = %other, "retrieval failed");
                internal(other.to_string())
            }
        }
    }
}

fn resolve_profile(
    retrieval: &RetrievalConfig,
    name: Option<&str>,
    threshold: Option<f32>,
    top_k: Option<usize>,
) -> Result<RetrievalProfile, AppError> {
    search::resolve_profile(
        retrieval,
        name.unwrap_or("knowledge_base"),
        threshold,
        top_k,
    )
    .map_err(|e| bad_request(e.to_string()))
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(default)]
    profile: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let Json(request) = payload?;
    let message = request
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| bad_request("message must not be empty"))?;
    let profile = resolve_profile(&state.retrieval, request.profile.as_deref(), None, None)?;

    let (_retrieval, rx) = state
        .pipeline
        .ask(&message, request.history, profile)
        .await?;

    let stream = ReceiverStream::new(rx).map(|event| Ok(to_sse_event(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Token(text) => Event::default().event("token").data(text),
        StreamEvent::Done => Event::default().event("done").data(""),
        StreamEvent::Failed(message) => Event::default()
            .event("error")
            .data(serde_json::json!({ "message": message }).to_string()),
    }
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    threshold: Option<f32>,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Json(request) = payload?;
    let profile = resolve_profile(
        &state.retrieval,
        request.profile.as_deref(),
        request.threshold,
        request.top_k,
    )?;

    let results = state
        .pipeline
        .search(&request.query, profile)
        .await
        .map_err(|e| match e {
            PipelineError::EmptyQuery => bad_request("query must not be empty"),
            other => AppError::from(other),
        })?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /parse ============

#[derive(Deserialize)]
struct ParseParams {
    #[serde(default)]
    file_name: Option<String>,
}

#[derive(Serialize)]
struct ParseResponse {
    ok: bool,
    kind: &'static str,
    title: Option<String>,
    metadata: Option<ParseMetadata>,
    /// User-facing explanation when the document is not usable.
    message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outline: Option<Vec<OutlineItem>>,
}

async fn handle_parse(
    Query(params): Query<ParseParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ParseResponse>, AppError> {
    let media_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let file_name = params.file_name.unwrap_or_default();
    let kind = DocumentKind::detect(&media_type, &file_name);

    let parsed = tokio::task::spawn_blocking(move || extract::parse(&body, &media_type, &file_name))
        .await
        .map_err(|e| {
            error!(error = %e, "parser task failed");
            internal(format!("parser task failed: {}", e))
        })?;

    let message = extract::outcome_message(parsed.as_ref());
    let response = match parsed {
        None => ParseResponse {
            ok: false,
            kind: kind.as_str(),
            title: None,
            metadata: None,
            message,
            text: None,
            outline: None,
        },
        Some(result) => {
            let (text, items) = match &result.content {
                ParsedContent::Text(text) => (Some(text.clone()), None),
                ParsedContent::Manifest(root) => (None, Some(outline(root))),
            };
            ParseResponse {
                ok: message.is_none(),
                kind: kind.as_str(),
                title: result.title,
                metadata: result.metadata,
                message,
                text,
                outline: items,
            }
        }
    };
    Ok(Json(response))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    chunks: Option<usize>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let chunks = state.pipeline.index().count().await.ok();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        chunks,
    })
}
