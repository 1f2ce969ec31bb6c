#![forbid(unsafe_code)]

//! Axum backend for the download lifecycle.
//!
//! Clients ask for metadata, start a download, poll its progress and finally
//! fetch the artifact. All of the job bookkeeping lives in
//! [`JobController`]; this binary only translates HTTP to controller calls
//! and streams finished files back out.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::json;
use simplyt::{
    config::{RuntimeOverrides, ToolTable, resolve_runtime_settings},
    controller::{ControllerSettings, Delivery, JobController},
    error::{ErrorKind, JobError},
    jobs::JobId,
    metadata::{FormatKind, VideoMetadata},
    progress::JobSnapshot,
    runner::ProcessRunner,
    security::ensure_not_root,
};
use tokio::{
    fs::File,
    io::{AsyncRead, ReadBuf},
    signal,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "simplyt=info,backend=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "backend", version, about = "Download backend driving the extractor")]
struct BackendArgs {
    /// Parent directory for per-job working directories.
    #[arg(long, value_name = "DIR")]
    downloads_root: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// TOML file listing extractor candidates in priority order.
    #[arg(long, value_name = "FILE")]
    tools_file: Option<PathBuf>,

    /// Let a finished artifact be downloaded more than once.
    #[arg(long)]
    allow_redelivery: bool,

    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            downloads_root: self.downloads_root,
            host: self.host,
            port: self.port,
            tools_file: self.tools_file,
            allow_redelivery: self.allow_redelivery.then_some(true),
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/SIMPLYT_HOST")
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    controller: JobController,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: ErrorKind::NotFound,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound | ErrorKind::AlreadyDelivered => StatusCode::NOT_FOUND,
            ErrorKind::NotReady | ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::ToolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ExtractionFailed | ErrorKind::DownloadFailed => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    format_id: String,
    format_kind: Option<String>,
}

#[derive(Deserialize)]
struct SelectionRequest {
    #[serde(default)]
    format_id: String,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job_id: JobId,
}

#[derive(Serialize)]
struct SessionResponse {
    job_id: JobId,
    #[serde(flatten)]
    metadata: VideoMetadata,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = BackendArgs::parse();
    ensure_not_root("backend")?;

    let settings = resolve_runtime_settings(args.into_overrides())?;
    let tools = ToolTable::load(settings.tools_file.as_deref())?;
    tokio::fs::create_dir_all(&settings.downloads_root)
        .await
        .with_context(|| {
            format!(
                "creating downloads root {}",
                settings.downloads_root.display()
            )
        })?;
    info!(
        downloads_root = %settings.downloads_root.display(),
        candidates = tools.candidates.len(),
        allow_redelivery = settings.allow_redelivery,
        "backend configured"
    );

    let controller = JobController::new(
        ProcessRunner::new(tools.candidates),
        ControllerSettings::from(&settings),
    );
    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn({
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        async move { controller.run_retention_sweeper(shutdown).await }
    });

    let app = router(AppState { controller });

    let addr = SocketAddr::new(parse_host_arg(&settings.host)?, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "retention sweeper ended abnormally");
    }
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(request_metadata))
        .route("/api/downloads", post(start_download))
        .route("/api/downloads/{job_id}", delete(cancel_download))
        .route("/api/progress/{job_id}", get(get_progress))
        .route("/api/artifacts/{job_id}", get(download_artifact))
        .route("/api/sessions", post(open_session))
        .route("/api/sessions/{job_id}/selection", post(select_format))
        .fallback(api_fallback)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutdown requested");
}

async fn api_fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn request_metadata(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> ApiResult<Json<VideoMetadata>> {
    let metadata = state.controller.request_metadata(&payload.url).await?;
    Ok(Json(metadata))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<JobResponse>> {
    let kind = FormatKind::parse(payload.format_kind.as_deref())?;
    let job_id = state
        .controller
        .start_download(&payload.url, &payload.format_id, kind)?;
    Ok(Json(JobResponse { job_id }))
}

async fn get_progress(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let id = parse_job_id(&job_id)?;
    Ok(Json(state.controller.get_status(&id)?))
}

async fn cancel_download(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let id = parse_job_id(&job_id)?;
    state.controller.cancel(&id).await?;
    Ok(Json(state.controller.get_status(&id)?))
}

async fn open_session(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let (job_id, metadata) = state.controller.open_session(&payload.url).await?;
    Ok(Json(SessionResponse {
        job_id,
        metadata: Arc::unwrap_or_clone(metadata),
    }))
}

async fn select_format(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
    Json(payload): Json<SelectionRequest>,
) -> ApiResult<Json<JobResponse>> {
    let id = parse_job_id(&job_id)?;
    let job_id = state.controller.select_format(&id, &payload.format_id)?;
    Ok(Json(JobResponse { job_id }))
}

async fn download_artifact(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Response> {
    let id = parse_job_id(&job_id)?;
    let delivery = state.controller.claim_artifact(&id).await?;
    stream_artifact(delivery).await
}

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    raw.parse::<JobId>()
        .map_err(|_| ApiError::not_found("job not found"))
}

/// Streams the artifact and removes its directory once the body is gone,
/// whether the client read it to the end or hung up halfway.
async fn stream_artifact(delivery: Delivery) -> ApiResult<Response> {
    let cleanup = DirCleanup(delivery.cleanup_dir);
    let file = File::open(&delivery.path).await.map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => ApiError::not_found("artifact no longer exists"),
        _ => ApiError::internal(err.to_string()),
    })?;
    let length = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .len();

    let mime = MimeGuess::from_path(&delivery.path).first_or_octet_stream();
    let disposition = HeaderValue::from_str(&content_disposition(&delivery.filename))
        .map_err(|err| ApiError::internal(err.to_string()))?;
    let content_type = HeaderValue::from_str(mime.as_ref())
        .map_err(|err| ApiError::internal(err.to_string()))?;

    let reader = CleanupReader {
        file,
        _cleanup: cleanup,
    };
    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    debug!(job_id = %delivery.job_id, bytes = length, "streaming artifact");
    Ok(response)
}

/// `attachment` header with an ASCII fallback name plus the exact UTF-8
/// name in `filename*`.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

struct DirCleanup(Option<PathBuf>);

impl Drop for DirCleanup {
    fn drop(&mut self) {
        let Some(dir) = self.0.take() else {
            return;
        };
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!(path = %dir.display(), "delivered artifact removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove delivered artifact"),
        }
    }
}

struct CleanupReader {
    file: File,
    _cleanup: DirCleanup,
}

impl AsyncRead for CleanupReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}
