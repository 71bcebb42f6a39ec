//! HTTP server for the job control surface and the context indexer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/autopilot/start` | Create and start a job |
//! | `GET`  | `/autopilot` | List job summaries |
//! | `GET`  | `/autopilot/{id}/status` | Full job record |
//! | `POST` | `/autopilot/{id}/approve` | Approve the waiting step (all or selected files) |
//! | `POST` | `/autopilot/{id}/abort` | Abort a job |
//! | `POST` | `/autopilot/{id}/recover` | Reload a persisted job |
//! | `DELETE` | `/autopilot/{id}` | Forget a job (records on disk are kept) |
//! | `POST` | `/context/index` | Rebuild the workspace index |
//! | `GET`  | `/context/status` | Index status for `?root=` |
//! | `GET`  | `/context/search` | Ranked matches for `?root=&q=&k=` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "job not found: 1234" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `not_found` (404), `conflict` (409), `internal` (500).

use axum::{
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::engine::{ApproveRequest, Engine, StartRequest};
use crate::error::EngineError;
use crate::indexer::{index_status, pack_context, rebuild_index, search_index, IndexStatus};
use crate::models::{Job, JobSummary, ScoredItem};
use crate::runner::ApproveOutcome;

const MAX_SEARCH_K: usize = 50;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let app = router(AppState { engine });

    info!(bind = %bind_addr, "server listening");
    println!("stepwise server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/autopilot/start", post(handle_start))
        .route("/autopilot", get(handle_list))
        .route("/autopilot/{id}/status", get(handle_status))
        .route("/autopilot/{id}/approve", post(handle_approve))
        .route("/autopilot/{id}/abort", post(handle_abort))
        .route("/autopilot/{id}/recover", post(handle_recover))
        .route("/autopilot/{id}", delete(handle_forget))
        .route("/context/index", post(handle_index))
        .route("/context/status", get(handle_index_status))
        .route("/context/search", get(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
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

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::NoWaitingStep(_) | EngineError::JobTerminal { .. } => StatusCode::CONFLICT,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Internal(e) => {
                error!(error = %format!("{:#}", e), "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    EngineError::Internal(err).into()
}

/// Resolve a workspace root from a request, rejecting anything that is not
/// an existing directory.
fn workspace_root(raw: &str) -> Result<PathBuf, AppError> {
    if raw.trim().is_empty() {
        return Err(bad_request("root must not be empty"));
    }
    let path = Path::new(raw);
    if !path.is_dir() {
        return Err(bad_request(format!("not a directory: {}", raw)));
    }
    Ok(path.to_path_buf())
}

// ============ Autopilot handlers ============

async fn handle_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.engine.start(req).await?))
}

async fn handle_list(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    Json(state.engine.list())
}

async fn handle_status(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.engine.status(&id).await?))
}

async fn handle_approve(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<ApproveOutcome>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.engine.approve(&id, req).await?))
}

async fn handle_abort(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.engine.abort(&id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootBody {
    workspace_root: String,
}

async fn handle_recover(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    Json(body): Json<RootBody>,
) -> Result<Json<Job>, AppError> {
    let root = workspace_root(&body.workspace_root)?;
    Ok(Json(state.engine.recover(&root, &id).await?))
}

#[derive(Serialize)]
struct ForgetResponse {
    forgotten: String,
}

async fn handle_forget(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ForgetResponse>, AppError> {
    state.engine.forget(&id).await?;
    Ok(Json(ForgetResponse { forgotten: id }))
}

// ============ Context handlers ============

fn require_embeddings(state: &AppState) -> Result<(), AppError> {
    if state.engine.config().embedding.is_enabled() {
        Ok(())
    } else {
        Err(AppError {
            status: StatusCode::BAD_REQUEST,
            code: "embeddings_disabled".to_string(),
            message: "embedding provider is disabled".to_string(),
        })
    }
}

async fn handle_index(
    State(state): State<AppState>,
    Json(body): Json<RootBody>,
) -> Result<Json<IndexStatus>, AppError> {
    require_embeddings(&state)?;
    let root = workspace_root(&body.workspace_root)?;
    let engine = &state.engine;
    let status = rebuild_index(engine.config(), &root, engine.embedder())
        .await
        .map_err(internal)?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct StatusQuery {
    root: String,
}

async fn handle_index_status(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> Result<Json<IndexStatus>, AppError> {
    let root = workspace_root(&q.root)?;
    Ok(Json(index_status(state.engine.config(), &root)))
}

#[derive(Deserialize)]
struct SearchQuery {
    root: String,
    q: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    matches: Vec<ScoredItem>,
    packed: String,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, AppError> {
    require_embeddings(&state)?;
    if q.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let root = workspace_root(&q.root)?;
    let engine = &state.engine;
    let config = engine.config();
    let k = q.k.unwrap_or(config.retrieval.step_k).clamp(1, MAX_SEARCH_K);

    let matches = search_index(config, &root, engine.embedder(), &q.q, k)
        .await
        .map_err(internal)?;
    let packed = pack_context(&matches, config.retrieval.search_budget_chars);
    Ok(Json(SearchResponse { matches, packed }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
