//! HTTP collaborator surface.
//!
//! Exposes the corpus and the job subsystem as a JSON API for the UI and
//! launcher scripts. Queries run against the read-only handle; only the job
//! coordinator (and the bulk exporters' file writes) touch mutable state.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/conversations` | List with `limit`, `offset`, `search`, `gizmo_id` |
//! | `GET`  | `/api/conversations/{id}` | Single conversation with project join |
//! | `GET`  | `/api/conversations/{id}/messages` | Ordered messages |
//! | `GET`  | `/api/search?q&limit` | Ranked hits |
//! | `GET`  | `/api/stats` | Corpus totals |
//! | `GET`  | `/api/projects` | Projects with conversation counts |
//! | `GET`  | `/api/export/markdown?id&redact` | Per-conversation document |
//! | `POST` | `/api/export/{jsonl,pairs,obsidian}` | Bulk exports with `{redact}` |
//! | `POST` | `/api/jobs` | Submit a job |
//! | `GET`  | `/api/jobs/check?target_id&pattern` | Cache/deduplication probe |
//! | `GET/DELETE` | `/api/jobs/{id}` | Fetch or remove a job |
//! | `GET`  | `/api/jobs/{id}/stream` | SSE: `progress`, `done`, `failed` |
//! | `GET`  | `/api/jobs/{id}/download` | Stream the result artifact |
//! | `GET`  | `/health` | Health check |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `internal` (500). Worker
//! failures never surface here; they appear as job state on the stream.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::jobs::{Coordinator, SubmitError, SubmitRequest, WorkerSpawner};
use crate::models::{Conversation, Job, Message, Project, SearchHit, Stats};
use crate::{db, export, jobs, migrate, search, store};

#[derive(Clone)]
struct AppState {
    /// Read-only handle for all query paths.
    reader: SqlitePool,
    coordinator: Arc<Coordinator>,
    config: Arc<Config>,
}

/// Start the HTTP server. Runs migrations and the abandoned-job sweep before
/// binding.
pub async fn run_server(config: &Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let writer = db::connect(&config.db.path).await?;
    migrate::run_migrations(&writer).await?;

    let swept = jobs::recover_abandoned(&writer, config.worker.heartbeat_timeout_secs).await?;
    if swept > 0 {
        info!(count = swept, "marked abandoned jobs as failed");
    }

    let reader = db::connect_read_only(&config.db.path).await?;
    let spawner = WorkerSpawner::from_config(config, config_path.as_deref())?;
    let coordinator = Arc::new(Coordinator::new(
        writer,
        config.cache.dir.clone(),
        spawner,
    ));

    let state = AppState {
        reader,
        coordinator,
        config: Arc::new(config.clone()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{id}", get(get_conversation))
        .route("/api/conversations/{id}/messages", get(get_messages))
        .route("/api/search", get(run_search))
        .route("/api/stats", get(get_stats))
        .route("/api/projects", get(list_projects))
        .route("/api/export/markdown", get(export_markdown))
        .route("/api/export/jsonl", post(export_jsonl))
        .route("/api/export/pairs", post(export_pairs))
        .route("/api/export/obsidian", post(export_obsidian))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/check", get(check_job))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/stream", get(stream_job))
        .route("/api/jobs/{id}/download", get(download_job))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state);

    let bind = &config.server.bind;
    info!(%bind, "server listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
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

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal_error(e: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: e.to_string(),
    }
}

// ============ Conversations ============

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    search: Option<String>,
    gizmo_id: Option<String>,
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Conversation>>, AppError> {
    let filter = store::ConversationFilter {
        limit: q.limit.unwrap_or(200),
        offset: q.offset.unwrap_or(0),
        search: q.search,
        gizmo_id: q.gizmo_id,
    };
    let conversations = store::list_conversations(&state.reader, &filter)
        .await
        .map_err(internal_error)?;
    Ok(Json(conversations))
}

async fn get_conversation(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Conversation>, AppError> {
    store::get_conversation(&state.reader, &id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("conversation not found: {}", id)))
}

async fn get_messages(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Vec<Message>>, AppError> {
    if store::get_conversation(&state.reader, &id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found(format!("conversation not found: {}", id)));
    }
    let messages = store::get_messages(&state.reader, &id)
        .await
        .map_err(internal_error)?;
    Ok(Json(messages))
}

// ============ Search / stats / projects ============

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
    limit: Option<i64>,
}

async fn run_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let q = query.q.unwrap_or_default();
    if q.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let limit = query.limit.unwrap_or(state.config.retrieval.limit);
    let hits = search::search_messages(&state.reader, &q, limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(hits))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<Stats>, AppError> {
    let stats = store::stats(&state.reader).await.map_err(internal_error)?;
    Ok(Json(stats))
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, AppError> {
    let projects = store::list_projects(&state.reader)
        .await
        .map_err(internal_error)?;
    Ok(Json(projects))
}

// ============ Exports ============

#[derive(Deserialize)]
struct MarkdownQuery {
    id: Option<String>,
    #[serde(default)]
    redact: bool,
}

async fn export_markdown(
    State(state): State<AppState>,
    Query(q): Query<MarkdownQuery>,
) -> Result<Response, AppError> {
    let id = q
        .id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| bad_request("id must not be empty"))?;

    if store::get_conversation(&state.reader, &id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found(format!("conversation not found: {}", id)));
    }

    let mut redactor = q.redact.then(crate::redact::Redactor::new);
    let doc = export::conversation_markdown(&state.reader, &id, redactor.as_mut())
        .await
        .map_err(internal_error)?;
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        doc,
    )
        .into_response())
}

#[derive(Deserialize, Default)]
struct BulkExportRequest {
    #[serde(default)]
    redact: bool,
    /// Override for the output location; defaults under `[export].dir`.
    out: Option<PathBuf>,
}

#[derive(Serialize)]
struct BulkExportResponse {
    written: u64,
    path: String,
}

async fn export_jsonl(
    State(state): State<AppState>,
    Json(req): Json<BulkExportRequest>,
) -> Result<Json<BulkExportResponse>, AppError> {
    let out = req
        .out
        .unwrap_or_else(|| state.config.export.dir.join("messages.jsonl"));
    let written = export::export_messages_jsonl(&state.reader, &out, req.redact)
        .await
        .map_err(internal_error)?;
    Ok(Json(BulkExportResponse {
        written,
        path: out.display().to_string(),
    }))
}

async fn export_pairs(
    State(state): State<AppState>,
    Json(req): Json<BulkExportRequest>,
) -> Result<Json<BulkExportResponse>, AppError> {
    let out = req
        .out
        .unwrap_or_else(|| state.config.export.dir.join("pairs.jsonl"));
    let written = export::export_training_pairs(&state.reader, &out, req.redact)
        .await
        .map_err(internal_error)?;
    Ok(Json(BulkExportResponse {
        written,
        path: out.display().to_string(),
    }))
}

async fn export_obsidian(
    State(state): State<AppState>,
    Json(req): Json<BulkExportRequest>,
) -> Result<Json<BulkExportResponse>, AppError> {
    let out = req
        .out
        .unwrap_or_else(|| state.config.export.dir.join("obsidian_vault"));
    let report = export::export_vault(&state.reader, &out, req.redact)
        .await
        .map_err(internal_error)?;
    Ok(Json(BulkExportResponse {
        written: report.files_written,
        path: out.display().to_string(),
    }))
}

// ============ Jobs ============

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<Job>, AppError> {
    match state.coordinator.submit(&req).await {
        Ok(job) => Ok(Json(job)),
        Err(e @ SubmitError::InvalidPattern { .. }) => Err(bad_request(e.to_string())),
        Err(e @ SubmitError::TargetNotFound(_)) => Err(not_found(e.to_string())),
        Err(SubmitError::Store(e)) => Err(internal_error(e)),
    }
}

#[derive(Deserialize)]
struct CheckQuery {
    target_id: String,
    pattern: String,
}

#[derive(Serialize)]
struct CheckResponse {
    job: Option<Job>,
}

async fn check_job(
    State(state): State<AppState>,
    Query(q): Query<CheckQuery>,
) -> Result<Json<CheckResponse>, AppError> {
    let job = state
        .coordinator
        .check(&q.target_id, &q.pattern)
        .await
        .map_err(internal_error)?;
    Ok(Json(CheckResponse { job }))
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Job>, AppError> {
    store::get_job(&state.reader, &id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("job not found: {}", id)))
}

async fn delete_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .coordinator
        .delete(&id)
        .await
        .map_err(internal_error)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("job not found: {}", id)))
    }
}

async fn stream_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, AppError> {
    if store::get_job(&state.reader, &id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found(format!("job not found: {}", id)));
    }

    let stream = state.coordinator.stream(id).map(|ev| {
        let data = serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(ev.name()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn download_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, AppError> {
    let job = store::get_job(&state.reader, &id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("job not found: {}", id)))?;

    let rel = job
        .result_path
        .ok_or_else(|| not_found("job has no result artifact"))?;
    let path = state.coordinator.artifact_path(&rel);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| not_found("result artifact is missing on disk"))?;

    Ok((
        [(header::CONTENT_TYPE, "application/pdf")],
        bytes,
    )
        .into_response())
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
