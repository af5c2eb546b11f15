#![forbid(unsafe_code)]

//! Axum backend for the nasvid catalog.
//!
//! Serves the save directory as JSON (list + detail), the media files inside
//! it with Range support, and the static web UI. Submissions go through the
//! in-memory job queue, which runs `fetch_video` once per identifier; clients
//! follow a job through polling or Server-Sent Events.

use std::{
    convert::Infallible,
    fs,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Multipart, Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::stream::Stream;
use mime_guess::{MimeGuess, mime::Mime};
use nasvid_tools::{
    config::{AppConfig, RuntimeOverrides, resolve_runtime_paths},
    identifier,
    jobs::{BatchReceipt, FetchCommand, JobManager, JobSnapshot, SubmitError},
    library::{Library, VideoDetail, VideoSummary},
    logging,
    pipeline::Toolchain,
};
use parking_lot::RwLock;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

const PROGRESS_POLL: Duration = Duration::from_millis(500);
const LOG_POLL: Duration = Duration::from_millis(200);
const FETCH_BIN_NAME: &str = "fetch_video";

#[derive(Debug, Clone)]
struct BackendArgs {
    config_path: PathBuf,
    www_root: PathBuf,
    port: u16,
    listen_host: IpAddr,
    fetch_bin: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--config=") {
                config_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--config requires a value"))?;
                    config_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
            config_path: config_override,
            www_root: www_root_override,
            port: port_override,
            ..RuntimeOverrides::default()
        })?;
        let listen_host = match host_override {
            Some(host) => host,
            None => parse_host_arg(&runtime_paths.host)?,
        };

        Ok(Self {
            config_path: runtime_paths.config_path,
            www_root: runtime_paths.www_root,
            port: runtime_paths.port,
            listen_host,
            fetch_bin: runtime_paths.fetch_bin,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/NASVID_HOST")
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    library: Arc<Library>,
    cache: Arc<ApiCache>,
    token: Option<Arc<str>>,
    www_root: Arc<PathBuf>,
    jobs: JobManager,
}

/// The catalog listing, keyed on the library fingerprint and the number of
/// finished jobs. Details are cheap to rebuild and always read from disk.
struct ApiCache {
    videos: RwLock<Option<Vec<VideoSummary>>>,
    last_version: RwLock<Option<(u64, u64)>>,
}

impl ApiCache {
    fn new() -> Self {
        Self {
            videos: RwLock::new(None),
            last_version: RwLock::new(None),
        }
    }

    fn clear(&self) {
        self.videos.write().take();
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid bearer token".to_string(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");

    let BackendArgs {
        config_path,
        www_root,
        port,
        listen_host,
        fetch_bin,
    } = BackendArgs::parse()?;

    let config = AppConfig::load(&config_path)?;
    fs::create_dir_all(&config.save_path)
        .with_context(|| format!("creating {}", config.save_path.display()))?;
    if config.token.is_none() {
        warn!("no Token configured; submission endpoints accept anyone");
    }
    if let Err(err) = Toolchain::from_config(&config).check() {
        warn!("{err:#}; downloads will fail until it is installed");
    }

    let fetch_program = match fetch_bin {
        Some(path) => path,
        None => find_fetch_executable()?,
    };
    let config_arg = fs::canonicalize(&config_path)
        .with_context(|| format!("resolving {}", config_path.display()))?;
    let library = Library::new(config.save_path.clone(), &config.base_url);
    let jobs = JobManager::start(
        FetchCommand {
            program: fetch_program,
            args_prefix: vec![
                "--config".to_string(),
                config_arg.to_string_lossy().into_owned(),
            ],
        },
        library.clone(),
    );

    let state = AppState {
        library: Arc::new(library),
        cache: Arc::new(ApiCache::new()),
        token: config.token.as_deref().map(Arc::from),
        www_root: Arc::new(www_root),
        jobs,
    };

    let addr = SocketAddr::new(listen_host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{id}", get(get_video))
        .route("/api/addvideo/{id}", get(add_video))
        .route("/api/start", post(start_job))
        .route("/api/start_batch", post(start_batch))
        .route("/api/progress/{task_id}", get(get_progress))
        .route("/api/progress/{task_id}/stream", get(progress_stream))
        .route("/api/logs/{task_id}/stream", get(logs_stream))
        .route("/api/download/{id}", get(download_video))
        .route("/media/{id}/{file}", get(media_file))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on the handler; Ctrl+C still ends the
    // process without it.
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {}", err);
    }
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Submissions require `Authorization: Bearer <Token>` when a token is
/// configured.
fn check_bearer(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

/// Returns the normalized identifier that lookups must use.
fn ensure_valid_id(id: &str) -> ApiResult<String> {
    identifier::parse(id).map_err(|err| ApiError::bad_request(err.to_string()))
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoSummary>>> {
    Ok(Json(state.get_video_list().await?))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoDetail>> {
    let id = ensure_valid_id(&id)?;
    Ok(Json(state.get_video_detail(&id).await?))
}

async fn add_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Json<JobSnapshot>> {
    check_bearer(&state, &headers)?;
    Ok(Json(state.jobs.submit(&id)?))
}

#[derive(Deserialize)]
struct StartForm {
    plate: String,
}

async fn start_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<StartForm>,
) -> ApiResult<Json<JobSnapshot>> {
    check_bearer(&state, &headers)?;
    Ok(Json(state.jobs.submit(&form.plate)?))
}

async fn start_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<BatchReceipt>> {
    check_bearer(&state, &headers)?;

    let mut content = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        if field.name() == Some("file") {
            let text = field
                .text()
                .await
                .map_err(|err| ApiError::bad_request(err.to_string()))?;
            content = Some(text);
            break;
        }
    }
    let content = content.ok_or_else(|| ApiError::bad_request("missing `file` field"))?;
    Ok(Json(state.jobs.submit_batch(&content)?))
}

async fn get_progress(
    State(state): State<AppState>,
    AxumPath(task_id): AxumPath<String>,
) -> ApiResult<Json<JobSnapshot>> {
    state
        .jobs
        .snapshot(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("task not found"))
}

/// Emits the job snapshot whenever it changes and an `end` event once the job
/// has finished.
async fn progress_stream(
    State(state): State<AppState>,
    AxumPath(task_id): AxumPath<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if state.jobs.snapshot(&task_id).is_none() {
        return Err(ApiError::not_found("task not found"));
    }

    let jobs = state.jobs.clone();
    let stream = async_stream::stream! {
        let mut last: Option<JobSnapshot> = None;
        loop {
            let Some(snapshot) = jobs.snapshot(&task_id) else {
                break;
            };
            if last.as_ref() != Some(&snapshot) {
                match Event::default().json_data(&snapshot) {
                    Ok(event) => yield Ok::<Event, Infallible>(event),
                    Err(err) => {
                        warn!("encoding progress for {task_id}: {err}");
                        break;
                    }
                }
            }
            let finished = snapshot.status.is_finished();
            last = Some(snapshot);
            if finished {
                yield Ok::<Event, Infallible>(Event::default().event("end").data("end"));
                break;
            }
            tokio::time::sleep(PROGRESS_POLL).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Tails the job's log ring. Each line is sent once, in sequence order.
async fn logs_stream(
    State(state): State<AppState>,
    AxumPath(task_id): AxumPath<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if state.jobs.snapshot(&task_id).is_none() {
        return Err(ApiError::not_found("task not found"));
    }

    let jobs = state.jobs.clone();
    let stream = async_stream::stream! {
        let mut cursor = 0u64;
        loop {
            let Some(batch) = jobs.logs_after(&task_id, cursor) else {
                break;
            };
            for entry in batch.lines {
                cursor = entry.seq;
                match Event::default().json_data(&entry) {
                    Ok(event) => yield Ok::<Event, Infallible>(event),
                    Err(err) => warn!("encoding log line for {task_id}: {err}"),
                }
            }
            if batch.finished {
                yield Ok::<Event, Infallible>(Event::default().event("end").data("end"));
                break;
            }
            tokio::time::sleep(LOG_POLL).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn download_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let id = ensure_valid_id(&id)?;
    let library = state.library.clone();
    let lookup_id = id.clone();
    let path = tokio::task::spawn_blocking(move || library.find_video_file(&lookup_id))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("video not downloaded yet"))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{id}.mp4"));
    stream_file(path, None, Some(&headers), Some(&file_name)).await
}

async fn media_file(
    State(state): State<AppState>,
    AxumPath((id, file)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    serve_media(&state, &id, &file, &headers).await
}

async fn serve_media(
    state: &AppState,
    id: &str,
    file: &str,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(id)?;
    ensure_safe_path_segment(file)?;
    if !identifier::is_valid(id) {
        return Err(ApiError::not_found("file not found"));
    }
    stream_file(state.library.media_path(id, file), None, Some(headers), None).await
}

impl AppState {
    async fn ensure_fresh_cache(&self) -> ApiResult<()> {
        let library = self.library.clone();
        let fingerprint = tokio::task::spawn_blocking(move || library.version())
            .await
            .map_err(|err| ApiError::internal(err.to_string()))?;
        let version = (fingerprint, self.jobs.finished_count());

        let mut last = self.cache.last_version.write();
        if *last != Some(version) {
            self.cache.clear();
        }
        *last = Some(version);
        Ok(())
    }

    /// Scans the save directory once per cache generation. The walks are
    /// blocking, so they run off the async workers.
    async fn get_video_list(&self) -> ApiResult<Vec<VideoSummary>> {
        self.ensure_fresh_cache().await?;
        if let Some(cached) = self.cache.videos.read().clone() {
            return Ok(cached);
        }

        let library = self.library.clone();
        let records = tokio::task::spawn_blocking(move || library.scan())
            .await
            .map_err(|err| ApiError::internal(err.to_string()))?
            .map_err(|err| ApiError::internal(format!("{err:#}")))?;

        let summaries: Vec<VideoSummary> = records
            .iter()
            .map(|record| self.library.summary(record))
            .collect();
        self.cache.videos.write().replace(summaries.clone());
        Ok(summaries)
    }

    async fn get_video_detail(&self, id: &str) -> ApiResult<VideoDetail> {
        let library = self.library.clone();
        let lookup_id = id.to_owned();
        let record = tokio::task::spawn_blocking(move || library.load(&lookup_id))
            .await
            .map_err(|err| ApiError::internal(err.to_string()))?
            .map_err(|err| ApiError::internal(format!("{err:#}")))?
            .ok_or_else(|| ApiError::not_found("video not found"))?;

        Ok(self.library.detail(&record))
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => {
            let index = root.join("index.html");
            stream_file(index, None, None, None).await
        }
        Ok(_) => stream_file(target, None, None, None).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                let index = root.join("index.html");
                stream_file(index, None, None, None).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    Path::new(trimmed).extension().is_none()
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }

    Ok(())
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|err| ApiError::internal(err.to_string()))
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
    attachment: Option<&str>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if metadata.is_dir() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        response
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = guessed
        && let Ok(value) = HeaderValue::try_from(mime.to_string())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = attachment {
        response.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            header_value(format!("attachment; filename=\"{name}\""))?,
        );
    }

    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?;
    let value = value.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

fn find_fetch_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_fetch_video") {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let docker_path = PathBuf::from("/usr/local/bin").join(FETCH_BIN_NAME);
    if docker_path.exists() {
        return Ok(docker_path);
    }

    let mut sibling = std::env::current_exe().context("locating backend executable")?;
    sibling.set_file_name(FETCH_BIN_NAME);
    if sibling.exists() {
        return Ok(sibling);
    }

    bail!("{FETCH_BIN_NAME} binary not found; set NASVID_FETCH_BIN");
}
