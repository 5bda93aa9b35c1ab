use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

mod requests;

use crate::catalog::{
    AudioOp, NamedFilter, Operation, TextOverlay, TransformCatalog, TransformRequest,
};
use crate::config::{resolve_relative_to, AppConfig, ANY_ORIGIN};
use crate::engine::FfmpegEngine;
use crate::error::EditError;
use crate::probe::FfprobeProber;
use crate::queue::{AdmissionQueue, JobSnapshot};
use crate::runtime::locate_binary;
use crate::service::{EditService, TransformOutcome};
use crate::store::{discard, ArtifactKind, ArtifactStore};
use crate::streaming::serve_file;
use requests::{AudioBody, FilterBody, MergeBody, TextBody, TrimBody};

/// Headroom for multipart framing on top of the per-file limit.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    service: EditService,
    started_at: Instant,
    max_files_per_upload: usize,
    allowed_origins: Vec<String>,
    ffmpeg_path: Option<PathBuf>,
}

impl AppState {
    /// The ffmpeg lookup walks several directories, so it runs once here
    /// rather than on every health check.
    pub fn new(service: EditService, config: &AppConfig) -> Self {
        let ffmpeg_path = locate_binary(&config.engine.ffmpeg_bin);
        Self {
            inner: Arc::new(AppStateInner {
                service,
                started_at: Instant::now(),
                max_files_per_upload: config.limits.max_files_per_upload.max(1),
                allowed_origins: config.server.allowed_origins.clone(),
                ffmpeg_path,
            }),
        }
    }

    /// Wire the production stack: on-disk store, ffprobe, ffmpeg and the queue.
    pub async fn from_config(config: &AppConfig, data_dir: &StdPath) -> Result<Self> {
        let store = ArtifactStore::new(
            resolve_relative_to(data_dir, &config.paths.uploads_dir),
            resolve_relative_to(data_dir, &config.paths.processed_dir),
        );
        store.ensure_dirs().await?;

        let engine = Arc::new(FfmpegEngine::new(config.engine.ffmpeg_bin.clone()));
        let queue = AdmissionQueue::new(engine, config.limits.concurrency());
        let prober = Arc::new(FfprobeProber::new(config.engine.ffprobe_bin.clone()));
        let service = EditService::new(
            store,
            TransformCatalog::new(config.output.clone()),
            prober,
            queue,
            config.limits.max_upload_bytes,
        );
        Ok(Self::new(service, config))
    }

    pub fn service(&self) -> &EditService {
        &self.inner.service
    }

    pub fn store(&self) -> &ArtifactStore {
        self.inner.service.store()
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let per_file = state.service().max_upload_bytes();
    let single_limit = body_limit(per_file.saturating_add(MULTIPART_OVERHEAD_BYTES));
    let multi_limit = body_limit(
        per_file
            .saturating_mul(state.inner.max_files_per_upload as u64)
            .saturating_add(MULTIPART_OVERHEAD_BYTES),
    );
    let cors = cors_layer(&state.inner.allowed_origins);

    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::max(single_limit)),
        )
        .route(
            "/api/upload-multiple",
            post(upload_multiple).layer(DefaultBodyLimit::max(multi_limit)),
        )
        .route(
            "/api/video/{filename}",
            get(stream_upload).delete(delete_upload),
        )
        .route(
            "/api/processed-video/{filename}",
            get(stream_processed).delete(delete_processed),
        )
        .route("/api/export/{filename}", get(export))
        .route("/api/trim", post(trim))
        .route("/api/filter", post(filter))
        .route("/api/text", post(text))
        .route("/api/merge", post(merge))
        .route("/api/audio", post(audio))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn body_limit(bytes: u64) -> usize {
    usize::try_from(bytes).unwrap_or(usize::MAX)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|origin| origin == ANY_ORIGIN) {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::ACCEPT_RANGES,
            header::CONTENT_DISPOSITION,
        ])
}

// ─── Health & jobs ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    queue: QueueHealth,
    ffmpeg_available: bool,
}

#[derive(Serialize)]
struct QueueHealth {
    running: usize,
    queued: usize,
    capacity: usize,
    completed: u64,
    failed: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.service().queue().stats();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.inner.started_at.elapsed().as_secs(),
        queue: QueueHealth {
            running: stats.running,
            queued: stats.waiting,
            capacity: stats.max_concurrent,
            completed: stats.completed,
            failed: stats.failed,
        },
        ffmpeg_available: state.inner.ffmpeg_path.is_some(),
    })
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.service().queue().jobs())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, AppError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::BadRequest(format!("invalid job id: {id}")))?;
    state
        .service()
        .queue()
        .job(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))
}

async fn api_route_not_found() -> AppError {
    AppError::NotFound("route not found".to_string())
}

// ─── Uploads ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    filename: String,
    original_name: String,
    size: u64,
    duration: f64,
    width: u32,
    height: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadedFile {
    filename: String,
    original_name: String,
    size: u64,
}

#[derive(Serialize)]
struct UploadMultipleResponse {
    files: Vec<UploadedFile>,
}

const UPLOAD_FIELD: &str = "video";

async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let mut multipart = multipart.map_err(|err| AppError::BadRequest(err.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(err.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();

        let artifact = state
            .service()
            .ingest(Some(&original_name), &content_type, Box::pin(field))
            .await?;
        let info = state.service().media_info(&artifact.path).await;

        return Ok(Json(UploadResponse {
            filename: artifact.name,
            original_name,
            size: artifact.size,
            duration: info.duration,
            width: info.width,
            height: info.height,
        }));
    }

    Err(AppError::BadRequest(format!(
        "no file provided in field '{UPLOAD_FIELD}'"
    )))
}

async fn upload_multiple(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadMultipleResponse>, AppError> {
    let mut multipart = multipart.map_err(|err| AppError::BadRequest(err.body_text()))?;
    let max_files = state.inner.max_files_per_upload;
    let mut stored = Vec::new();

    let outcome = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| AppError::BadRequest(err.body_text()))?
        {
            if field.file_name().is_none() {
                continue;
            }
            if stored.len() == max_files {
                return Err(AppError::BadRequest(format!(
                    "at most {max_files} files may be uploaded at once"
                )));
            }
            let original_name = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().unwrap_or_default().to_string();
            let artifact = state
                .service()
                .ingest(Some(&original_name), &content_type, Box::pin(field))
                .await?;
            stored.push((artifact, original_name));
        }
        Ok::<(), AppError>(())
    }
    .await;

    if let Err(err) = outcome {
        for (artifact, _) in &stored {
            discard(&artifact.path).await;
        }
        return Err(err);
    }
    if stored.is_empty() {
        return Err(AppError::BadRequest("no files provided".to_string()));
    }

    info!(count = stored.len(), "Batch upload stored");
    Ok(Json(UploadMultipleResponse {
        files: stored
            .into_iter()
            .map(|(artifact, original_name)| UploadedFile {
                filename: artifact.name,
                original_name,
                size: artifact.size,
            })
            .collect(),
    }))
}

// ─── Streaming, export, delete ───────────────────────────────────────────────

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|value| value.to_str().ok())
}

async fn stream_artifact(
    state: &AppState,
    filename: &str,
    kind: ArtifactKind,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let path = state.store().resolve(filename, kind).await?;
    Ok(serve_file(&path, range_header(headers), None).await?)
}

async fn stream_upload(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    stream_artifact(&state, &filename, ArtifactKind::Upload, &headers).await
}

async fn stream_processed(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    stream_artifact(&state, &filename, ArtifactKind::Processed, &headers).await
}

async fn export(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (_, path) = state
        .store()
        .resolve_any(&filename, &[ArtifactKind::Processed, ArtifactKind::Upload])
        .await?;
    Ok(serve_file(&path, range_header(&headers), Some(&filename)).await?)
}

async fn delete_upload(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<StatusCode, AppError> {
    state.store().remove(&filename, ArtifactKind::Upload).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_processed(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .store()
        .remove(&filename, ArtifactKind::Processed)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Transforms ──────────────────────────────────────────────────────────────

async fn run_transform(
    state: &AppState,
    request: TransformRequest,
) -> Result<Json<TransformOutcome>, AppError> {
    Ok(Json(state.service().transform(request).await?))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

async fn trim(
    State(state): State<AppState>,
    body: Result<Json<TrimBody>, JsonRejection>,
) -> Result<Json<TransformOutcome>, AppError> {
    let body = json_body(body)?;
    let filename = requests::required(body.filename, "filename")?;
    let start = requests::required(body.start_time, "startTime")?;
    let end = requests::required(body.end_time, "endTime")?;
    run_transform(
        &state,
        TransformRequest::single(filename, Operation::Trim { start, end }),
    )
    .await
}

async fn filter(
    State(state): State<AppState>,
    body: Result<Json<FilterBody>, JsonRejection>,
) -> Result<Json<TransformOutcome>, AppError> {
    let body = json_body(body)?;
    let filename = requests::required(body.filename, "filename")?;
    let named: NamedFilter = requests::required(body.filter, "filter")?.parse()?;
    run_transform(
        &state,
        TransformRequest::single(filename, Operation::Filter(named)),
    )
    .await
}

async fn text(
    State(state): State<AppState>,
    body: Result<Json<TextBody>, JsonRejection>,
) -> Result<Json<TransformOutcome>, AppError> {
    let body = json_body(body)?;
    let filename = requests::required(body.filename, "filename")?;
    let mut overlay = TextOverlay::new(requests::required(body.text, "text")?);
    if let Some(size) = body.font_size {
        overlay.font_size = requests::font_size(size);
    }
    if let Some(color) = body.font_color {
        overlay.font_color = color;
    }
    if let Some(x) = body.x {
        overlay.x = x;
    }
    if let Some(y) = body.y {
        overlay.y = y;
    }
    overlay.start = body.start_time;
    overlay.end = body.end_time;
    run_transform(
        &state,
        TransformRequest::single(filename, Operation::Text(overlay)),
    )
    .await
}

async fn merge(
    State(state): State<AppState>,
    body: Result<Json<MergeBody>, JsonRejection>,
) -> Result<Json<TransformOutcome>, AppError> {
    let body = json_body(body)?;
    let inputs = requests::required(body.filenames, "filenames")?;
    run_transform(
        &state,
        TransformRequest {
            inputs,
            operation: Operation::Merge,
        },
    )
    .await
}

async fn audio(
    State(state): State<AppState>,
    body: Result<Json<AudioBody>, JsonRejection>,
) -> Result<Json<TransformOutcome>, AppError> {
    let body = json_body(body)?;
    let filename = requests::required(body.filename, "filename")?;
    let operation = requests::required(body.operation, "operation")?;
    let op = AudioOp::parse(&operation, body.volume)?;
    run_transform(
        &state,
        TransformRequest::single(filename, Operation::Audio(op)),
    )
    .await
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    Internal {
        error: String,
        details: Option<String>,
    },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg, None),
            AppError::Internal { error, details } => {
                error!(error = %error, details = details.as_deref().unwrap_or_default(), "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, error, details)
            }
        };

        let body = Json(ErrorResponse { error, details });
        (status, body).into_response()
    }
}

impl From<EditError> for AppError {
    fn from(err: EditError) -> Self {
        match err {
            EditError::Validation(msg) => AppError::BadRequest(msg),
            EditError::NotFound(msg) => AppError::NotFound(msg),
            EditError::TooLarge(msg) => AppError::PayloadTooLarge(msg),
            EditError::Engine(engine) => AppError::Internal {
                error: "processing failed".to_string(),
                details: Some(engine.to_string()),
            },
            EditError::Internal(msg) => AppError::Internal {
                error: msg,
                details: None,
            },
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal {
            error: format!("{:#}", err),
            details: None,
        }
    }
}
