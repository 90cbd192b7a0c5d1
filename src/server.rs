//! HTTP retrieval server.
//!
//! Exposes text and image retrieval as a JSON API for the web front end.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/retrieve/text` | `{query, top_k?, explain?}` |
//! | `POST` | `/retrieve/image` | `{image_base64, filename?, top_k?, explain?}` |
//! | `GET`  | `/labels/{image_name}` | Label catalog row for one meme |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Both retrieval endpoints answer
//!
//! ```json
//! { "results": [{ "image_name": "meme_2.jpg", "score": 0.0161, "sentiment": "positive" }] }
//! ```
//!
//! and add `channels` and `decomposition` when `explain` is set.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser front end
//! can be served from another origin.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use meme_search_core::models::{Query, QueryDecomposition};
use meme_search_core::retrieve::ChannelReport;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::labels::LabelRecord;
use crate::model_server::cleaned_path;
use crate::search::{SearchHit, SearchResponse, SearchService};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    search: Arc<SearchService>,
    upload_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(search: SearchService, upload_dir: PathBuf) -> Self {
        Self {
            search: Arc::new(search),
            upload_dir: Arc::new(upload_dir),
        }
    }
}

/// Build the router. Split out from [`run_server`] so tests can serve it on
/// an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/retrieve/text", post(handle_retrieve_text))
        .route("/retrieve/image", post(handle_retrieve_image))
        .route("/labels/{image_name}", get(handle_label))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let search = SearchService::from_config(config).await?;
    let state = AppState::new(search, config.server.upload_dir.clone());

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "meme search server listening");
    println!("Meme search server listening on http://{}", bind_addr);

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
    code: &'static str,
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

fn internal(err: anyhow::Error) -> AppError {
    warn!(error = %format!("{:#}", err), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

// ============ Retrieval ============

#[derive(Deserialize)]
struct TextRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    explain: bool,
}

#[derive(Deserialize)]
struct ImageRequest {
    image_base64: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    explain: bool,
}

#[derive(Serialize)]
struct RetrieveResponse {
    results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decomposition: Option<QueryDecomposition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channels: Option<Vec<ChannelReport>>,
}

impl RetrieveResponse {
    fn new(response: SearchResponse, explain: bool) -> Self {
        if explain {
            Self {
                results: response.results,
                decomposition: response.decomposition,
                channels: Some(response.channels),
            }
        } else {
            Self {
                results: response.results,
                decomposition: None,
                channels: None,
            }
        }
    }
}

fn check_top_k(top_k: Option<usize>) -> Result<(), AppError> {
    match top_k {
        Some(0) => Err(bad_request("top_k must be >= 1")),
        _ => Ok(()),
    }
}

async fn handle_retrieve_text(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> Result<Json<RetrieveResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    check_top_k(request.top_k)?;

    let response = state
        .search
        .search(&Query::Text(request.query), request.top_k)
        .await;
    Ok(Json(RetrieveResponse::new(response, request.explain)))
}

async fn handle_retrieve_image(
    State(state): State<AppState>,
    Json(request): Json<ImageRequest>,
) -> Result<Json<RetrieveResponse>, AppError> {
    check_top_k(request.top_k)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(request.image_base64.trim())
        .map_err(|e| bad_request(format!("image_base64 is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(bad_request("image_base64 must not be empty"));
    }

    let upload = Upload {
        path: upload_path(&state.upload_dir, request.filename.as_deref()),
    };
    save_upload(&upload.path, &bytes).await.map_err(internal)?;

    let response = state
        .search
        .search(&Query::Image(upload.path.clone()), request.top_k)
        .await;
    Ok(Json(RetrieveResponse::new(response, request.explain)))
}

/// A query image saved for the model server. The file and the text-removed
/// copy written next to it are deleted on drop.
struct Upload {
    path: PathBuf,
}

impl Drop for Upload {
    fn drop(&mut self) {
        for path in [self.path.clone(), cleaned_path(&self.path)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove upload"),
            }
        }
    }
}

/// `<upload_dir>/<uuid>_<sanitized name>`. Directory parts of the client
/// name are dropped and anything outside `[A-Za-z0-9._-]` becomes `_`.
fn upload_path(upload_dir: &FsPath, filename: Option<&str>) -> PathBuf {
    let base = filename
        .and_then(|f| f.rsplit(['/', '\\']).next())
        .map(|f| {
            f.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        })
        .filter(|f| !f.trim_matches('.').is_empty())
        .unwrap_or_else(|| "upload.jpg".to_string());
    upload_dir.join(format!("{}_{}", Uuid::new_v4().simple(), base))
}

async fn save_upload(path: &FsPath, bytes: &[u8]) -> anyhow::Result<()> {
    use anyhow::Context;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

// ============ GET /labels/{image_name} ============

async fn handle_label(
    State(state): State<AppState>,
    Path(image_name): Path<String>,
) -> Result<Json<LabelRecord>, AppError> {
    state
        .search
        .labels()
        .record_by_image_name(&image_name)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("no label for image: {}", image_name)))
}

// ============ GET /health ============

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
