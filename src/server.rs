//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/manuals` | All manuals, sorted by unit |
//! | `GET`    | `/manuals/{unit}` | One manual record |
//! | `PUT`    | `/manuals/{unit}` | Upload the raw file body (`?filename=&description=&replace=`) |
//! | `DELETE` | `/manuals/{unit}` | Delete the manual and its index |
//! | `GET`    | `/manuals/{unit}/download` | The stored manual file, as an attachment |
//! | `POST`   | `/manuals/{unit}/reindex` | Re-index from the stored file |
//! | `POST`   | `/chat` | Answer one chat turn |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no manual registered for unit 102" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `index_error` (500), `internal` (500), `upstream_error` (502),
//! `service_unavailable` (503), `search_unavailable` (503).

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use manual_copilot_core::answer::{Answer, SourcePassage};
use manual_copilot_core::models::{Citation, ManualRecord};
use manual_copilot_core::{FailureKind, RagError};

use crate::app::App;
use crate::chat::ChatRequest;
use crate::config::Config;
use crate::extract::{MIME_PDF, MIME_TEXT};
use crate::ingest::{IndexOutcome, ManualError, StoredManual, Upload};

/// Open the application and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = Arc::new(App::open(config).await?);
    let bind_addr = config.server.bind.clone();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "copilot server listening");
    axum::serve(listener, router(app)).await?;

    Ok(())
}

/// All routes, with CORS and the upload size limit applied.
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let max_upload = app.config.server.max_upload_bytes;

    Router::new()
        .route("/health", get(handle_health))
        .route("/manuals", get(handle_list_manuals))
        .route(
            "/manuals/{unit}",
            get(handle_get_manual)
                .put(handle_upload_manual)
                .delete(handle_delete_manual),
        )
        .route("/manuals/{unit}/download", get(handle_download_manual))
        .route("/manuals/{unit}/reindex", post(handle_reindex_manual))
        .route("/chat", post(handle_chat))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(cors)
        .with_state(app)
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let (status, code) = classify(&err);
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %message, "request failed");
        }
        AppError {
            status,
            code,
            message,
        }
    }
}

/// Map typed errors carried by `err` to an HTTP status and error code.
fn classify(err: &anyhow::Error) -> (StatusCode, &'static str) {
    if let Some(e) = err.downcast_ref::<ManualError>() {
        return match e {
            ManualError::NotFound(_) | ManualError::FileMissing(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ManualError::AlreadyExists(_) => (StatusCode::CONFLICT, "conflict"),
            ManualError::UnsupportedType(_) | ManualError::EmptyUpload => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
        };
    }
    if let Some(e) = err.downcast_ref::<RagError>() {
        return match e {
            RagError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            RagError::SearchUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "search_unavailable")
            }
            RagError::EmbeddingService { kind, .. } | RagError::GenerationService { kind, .. } => {
                match kind {
                    FailureKind::Transient => {
                        (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
                    }
                    FailureKind::Terminal => (StatusCode::BAD_GATEWAY, "upstream_error"),
                }
            }
            RagError::IndexRead { .. } | RagError::IndexWrite { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "index_error")
            }
            RagError::ExtractionEmpty { .. } | RagError::UnsupportedCitation { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
    }
    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
}

type ApiResult<T> = Result<T, AppError>;

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

// ============ /manuals ============

#[derive(Serialize)]
struct ManualListResponse {
    manuals: Vec<ManualRecord>,
}

async fn handle_list_manuals(State(app): State<Arc<App>>) -> ApiResult<Json<ManualListResponse>> {
    let manuals = app.manuals.list().await?;
    Ok(Json(ManualListResponse { manuals }))
}

async fn handle_get_manual(
    State(app): State<Arc<App>>,
    Path(unit): Path<String>,
) -> ApiResult<Json<ManualRecord>> {
    Ok(Json(app.manuals.get(&unit).await?))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: Option<String>,
    description: Option<String>,
    #[serde(default)]
    replace: bool,
}

/// Without `?filename=`, the name is derived from the unit and the
/// request's `Content-Type`.
fn upload_filename(unit: &str, params: &UploadParams, headers: &HeaderMap) -> String {
    if let Some(name) = params.filename.as_deref().filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with(MIME_PDF) {
        format!("{unit}.pdf")
    } else if content_type.starts_with(MIME_TEXT) {
        format!("{unit}.txt")
    } else {
        unit.to_string()
    }
}

async fn handle_upload_manual(
    State(app): State<Arc<App>>,
    Path(unit): Path<String>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<IndexOutcome>> {
    let filename = upload_filename(&unit, &params, &headers);
    let outcome = app
        .manuals
        .upload(Upload {
            unit,
            filename,
            description: params.description,
            bytes: body.to_vec(),
            replace: params.replace,
        })
        .await?;
    Ok(Json(outcome))
}

/// `Content-Disposition` for `filename`, restricted to printable ASCII so
/// the header value is always valid.
fn attachment_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

async fn handle_download_manual(
    State(app): State<Arc<App>>,
    Path(unit): Path<String>,
) -> ApiResult<Response> {
    let StoredManual {
        filename,
        content_type,
        bytes,
    } = app.manuals.download(&unit).await?;
    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (header::CONTENT_DISPOSITION, attachment_disposition(&filename)),
    ];
    Ok((headers, bytes).into_response())
}

async fn handle_reindex_manual(
    State(app): State<Arc<App>>,
    Path(unit): Path<String>,
) -> ApiResult<Json<IndexOutcome>> {
    Ok(Json(app.manuals.reindex(&unit).await?))
}

async fn handle_delete_manual(
    State(app): State<Arc<App>>,
    Path(unit): Path<String>,
) -> ApiResult<StatusCode> {
    app.manuals.delete(&unit).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /chat ============

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
    citations: Vec<Citation>,
    sources: Vec<SourcePassage>,
    unsupported_citations: Vec<Citation>,
    verified: bool,
    grounded: bool,
}

impl From<Answer> for ChatResponse {
    fn from(a: Answer) -> Self {
        Self {
            answer: a.text,
            citations: a.citations,
            sources: a.sources,
            unsupported_citations: a.unsupported_citations,
            verified: a.verified,
            grounded: a.grounded,
        }
    }
}

async fn handle_chat(
    State(app): State<Arc<App>>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    let answer = app.chat.ask(&request).await?;
    Ok(Json(answer.into()))
}
