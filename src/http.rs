//! HTTP front end: player API, basic-auth gated admin API and static assets.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::json;
use tokio::fs::File;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogStore, VideoWithSubtitles};
use crate::config::Credentials;
use crate::context::OpContext;
use crate::error::{CatalogError, ServiceError};
use crate::service::{CreatedVideo, KeyResolver, Subbed, SubtitleUpload, VideoDetail};
use crate::subtitle::SubtitleFormat;

const INDEX_PAGE: &str = "index.html";
const ADMIN_PAGE: &str = "admin.html";
const STATIC_PREFIX: &str = "/static";
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const AUTH_REALM: &str = "Basic realm=\"Restricted\"";

pub type AppService = Subbed<CatalogStore>;

#[derive(Clone)]
pub struct AppState {
    service: Arc<AppService>,
    credentials: Arc<Credentials>,
    static_root: Arc<PathBuf>,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        service: AppService,
        credentials: Credentials,
        static_root: PathBuf,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service: Arc::new(service),
            credentials: Arc::new(credentials),
            static_root: Arc::new(static_root),
            request_timeout,
            shutdown,
        }
    }

    /// Context for one request: bounded by the request timeout and cancelled
    /// on server shutdown.
    fn request_ctx(&self) -> OpContext {
        OpContext::child_of(&self.shutdown).with_timeout(self.request_timeout)
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let api = match &err {
            ServiceError::InvalidInput(message) => Self::bad_request(message.clone()),
            ServiceError::NotFound => Self::not_found("no such video"),
            ServiceError::Catalog(catalog) => match catalog {
                CatalogError::Conflict(_) => Self::new(StatusCode::CONFLICT, "url already registered"),
                CatalogError::MissingVideo(_) => Self::not_found("no such video"),
                CatalogError::Cancelled => {
                    Self::new(StatusCode::GATEWAY_TIMEOUT, "request aborted/timeout")
                }
                CatalogError::LockTimeout(_) => {
                    Self::new(StatusCode::SERVICE_UNAVAILABLE, "catalog is busy, retry later")
                }
                CatalogError::Unavailable(_) | CatalogError::Worker(_) => {
                    Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                }
            },
        };

        if api.status.is_server_error() {
            error!(status = %api.status, error = %err, "request failed");
        } else {
            warn!(status = %api.status, error = %err, "request rejected");
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let admin_gate = middleware::from_fn_with_state(state.clone(), require_admin);

    let admin_api = Router::new()
        .route("/videos", get(list_videos).post(add_video))
        .route("/videos/{id}", delete(delete_video))
        .route("/subtitles", post(upload_subtitle))
        .route("/subtitles/{id}", delete(delete_subtitle))
        .route_layer(admin_gate.clone());

    let admin_page = Router::new()
        .route("/admin", get(serve_admin_page))
        .route_layer(admin_gate);

    Router::new()
        .route("/", get(serve_index_page))
        .route("/api/video", get(get_video))
        .merge(admin_page)
        .nest("/api/admin", admin_api)
        .fallback(serve_static)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if status.is_success() {
        debug!(%method, %path, status = status.as_u16(), elapsed_ms, "request");
    } else {
        info!(%method, %path, status = status.as_u16(), elapsed_ms, "request");
    }
    response
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if is_authorized(request.headers(), &state.credentials) {
        return next.run(request).await;
    }
    let mut response = ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(AUTH_REALM));
    response
}

fn is_authorized(headers: &HeaderMap, expected: &Credentials) -> bool {
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((username, password)) = decoded.split_once(':') else {
        return false;
    };

    // Evaluate both so the response time does not reveal which one matched.
    let user_ok = constant_time_eq(username.as_bytes(), expected.username.as_bytes());
    let pass_ok = constant_time_eq(password.as_bytes(), expected.password.as_bytes());
    user_ok & pass_ok
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Deserialize)]
struct VideoQuery {
    url: Option<String>,
}

async fn get_video(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
) -> ApiResult<Json<VideoDetail>> {
    let ctx = state.request_ctx();
    let _abort = ctx.token().clone().drop_guard();
    let url = query.url.unwrap_or_default();
    let detail = state.service.video_detail(&ctx, &url).await?;
    Ok(Json(detail))
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoWithSubtitles>>> {
    let ctx = state.request_ctx();
    let _abort = ctx.token().clone().drop_guard();
    let videos = state.service.admin_listing(&ctx).await?;
    Ok(Json(videos))
}

#[derive(Debug, Default, Deserialize)]
struct NewVideoRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
}

impl NewVideoRequest {
    /// Accepts a JSON body or an urlencoded form, like the admin page sends.
    fn parse(headers: &HeaderMap, body: &[u8]) -> ApiResult<Self> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        if content_type.starts_with("application/json") {
            return serde_json::from_slice(body).map_err(|_| ApiError::bad_request("Invalid request"));
        }
        if content_type.starts_with("application/x-www-form-urlencoded") {
            let mut request = Self::default();
            for (name, value) in url::form_urlencoded::parse(body) {
                match name.as_ref() {
                    "url" => request.url = value.into_owned(),
                    "title" => request.title = value.into_owned(),
                    _ => {}
                }
            }
            return Ok(request);
        }
        Err(ApiError::bad_request("Invalid request"))
    }
}

async fn add_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<CreatedVideo>> {
    let request = NewVideoRequest::parse(&headers, &body)?;
    let ctx = state.request_ctx();
    let _abort = ctx.token().clone().drop_guard();
    let created = state
        .service
        .create_video(&ctx, &request.url, &request.title)
        .await?;
    Ok(Json(created))
}

fn parse_id(raw: &str) -> ApiResult<i64> {
    raw.parse().map_err(|_| ApiError::bad_request("Invalid ID"))
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_id(&id)?;
    let ctx = state.request_ctx();
    let _abort = ctx.token().clone().drop_guard();
    state.service.delete_video(&ctx, id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_subtitle(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_id(&id)?;
    let ctx = state.request_ctx();
    let _abort = ctx.token().clone().drop_guard();
    state.service.delete_subtitle(&ctx, id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn upload_subtitle(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut video_id = None;
    let mut language = String::new();
    let mut declared = None;
    let mut content = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Invalid upload: {err}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("video_id") => {
                let raw = field_text(field).await?;
                video_id = Some(
                    raw.trim()
                        .parse::<i64>()
                        .map_err(|_| ApiError::bad_request("Invalid video ID"))?,
                );
            }
            Some("language") => language = field_text(field).await?,
            Some("type") => {
                let raw = field_text(field).await?;
                declared = Some(raw.parse::<SubtitleFormat>().map_err(ApiError::bad_request)?);
            }
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("Invalid upload: {err}")))?;
                content = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            _ => {}
        }
    }

    let video_id = video_id.ok_or_else(|| ApiError::bad_request("Invalid video ID"))?;
    let content = content.ok_or_else(|| ApiError::bad_request("No file uploaded"))?;
    let declared_format =
        declared.ok_or_else(|| ApiError::bad_request("subtitle type must be vtt or srt"))?;

    let ctx = state.request_ctx();
    let _abort = ctx.token().clone().drop_guard();
    state
        .service
        .upload_subtitle(
            &ctx,
            SubtitleUpload {
                video_id,
                language,
                declared_format,
                content,
            },
        )
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|err| ApiError::bad_request(format!("Invalid upload: {err}")))
}

async fn serve_index_page(State(state): State<AppState>) -> ApiResult<Response> {
    stream_file(state.static_root.join(INDEX_PAGE)).await
}

async fn serve_admin_page(State(state): State<AppState>) -> ApiResult<Response> {
    stream_file(state.static_root.join(ADMIN_PAGE)).await
}

/// Everything not routed above. `/static/...` is always a file lookup.
/// Other paths carrying an appended YouTube URL get the player page; the rest
/// are looked up under the static root.
async fn serve_static(State(state): State<AppState>, method: Method, uri: Uri) -> ApiResult<Response> {
    if method != Method::GET && method != Method::HEAD {
        return Err(ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    let path = uri.path();
    let relative = match path.strip_prefix(STATIC_PREFIX) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => {
            if state.service.resolver().url_from_path(path).is_some() {
                return stream_file(state.static_root.join(INDEX_PAGE)).await;
            }
            path
        }
    };
    let file = safe_join(&state.static_root, relative)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_file(file).await
}

/// Joins a request path onto `root`, refusing anything that is not a plain
/// descending path.
fn safe_join(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if joined == root {
        joined.push(INDEX_PAGE);
    }
    Some(joined)
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if file.metadata().await.map(|meta| meta.is_dir()).unwrap_or(false) {
        return Err(ApiError::not_found("file not found"));
    }

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first() {
        if let Ok(value) = mime.to_string().parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }

    Ok(response)
}
