//! Media HTTP server
//!
//! Serves files under the media root with byte-range support, permissive
//! CORS and caching disabled. Directory listings are never produced.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::catalog::is_work_dir_name;
use crate::range::{content_range, parse_range_header, unsatisfied_content_range, ByteRange};

/// Errors that can occur when starting the media server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Every port in the configured range is taken
    #[error("No free port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    /// Binding failed for a reason other than the port being taken
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Address the media server is reachable at for the rest of the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerBinding {
    pub host: String,
    pub port: u16,
}

impl ServerBinding {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// A running media server
#[derive(Debug)]
pub struct MediaServer {
    binding: ServerBinding,
    task: JoinHandle<()>,
}

impl MediaServer {
    pub fn binding(&self) -> &ServerBinding {
        &self.binding
    }

    /// Stop accepting connections
    pub fn abort(&self) {
        self.task.abort();
    }
}

#[derive(Debug)]
struct MediaRoot {
    root: PathBuf,
}

type SharedRoot = Arc<MediaRoot>;

/// Creates the axum Router serving files under `root`
pub fn create_media_router(root: PathBuf) -> Router {
    let root = std::fs::canonicalize(&root).unwrap_or(root);
    let state: SharedRoot = Arc::new(MediaRoot { root });

    Router::new()
        .fallback(serve_media)
        .with_state(state)
        .layer(always_header(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            "*",
        ))
        .layer(always_header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, HEAD, OPTIONS",
        ))
        .layer(always_header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Range, Content-Type",
        ))
        .layer(always_header(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            "Content-Length, Content-Range, Accept-Ranges",
        ))
        .layer(always_header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        ))
        .layer(TraceLayer::new_for_http())
}

fn always_header(name: HeaderName, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value))
}

/// Binds the first free port in `start..=end` and serves `root` in the background
///
/// # Returns
/// * `Ok(MediaServer)` once the listener is bound
/// * `Err(ServerError::PortExhausted)` if every port in the range is taken
pub async fn start(
    root: PathBuf,
    host: &str,
    port_start: u16,
    port_end: u16,
) -> Result<MediaServer, ServerError> {
    let listener = bind_first_free(host, port_start, port_end).await?;
    let port = listener.local_addr()?.port();
    let binding = ServerBinding {
        host: host.to_string(),
        port,
    };

    let app = create_media_router(root);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Media server error: {}", e);
        }
    });

    tracing::info!(url = %binding.url(), "Media server listening");
    Ok(MediaServer { binding, task })
}

/// Probe ports in order and return a listener on the first free one
pub async fn bind_first_free(host: &str, start: u16, end: u16) -> Result<TcpListener, ServerError> {
    for port in start..=end {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::debug!(port, "Port unavailable: {}", e);
            }
            Err(e) => return Err(ServerError::BindError(e)),
        }
    }
    Err(ServerError::PortExhausted { start, end })
}

/// Map a request path onto a file path under `root`.
///
/// Rejects trailing slashes, `.`/`..` segments, job work directories
/// (`.<key>_stream.partial-*`, `.<key>_stream.stale-*`) and anything that is
/// not a plain name. Other dot-files are served like any file.
pub fn resolve_request_path(root: &Path, raw_path: &str) -> Option<PathBuf> {
    if raw_path.ends_with('/') {
        return None;
    }
    let decoded = urlencoding::decode(raw_path).ok()?;
    if decoded.ends_with('/') {
        return None;
    }

    let mut path = root.to_path_buf();
    let mut depth = 0;
    for segment in decoded.split('/').filter(|s| !s.is_empty()) {
        // `.` and `..` fail the component check below
        if is_work_dir_name(segment) || segment.contains('\\') || segment.contains('\0') {
            return None;
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return None,
        }
        path.push(segment);
        depth += 1;
    }

    (depth > 0).then_some(path)
}

/// Content type by extension, with HLS types mime_guess does not know
pub fn content_type_for(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("m3u8") => "application/vnd.apple.mpegurl".to_string(),
        Some("ts") => "video/mp2t".to_string(),
        Some("m4s") => "video/iso.segment".to_string(),
        _ => mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

async fn serve_media(
    State(state): State<SharedRoot>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match method {
        Method::OPTIONS => return StatusCode::OK.into_response(),
        Method::GET | Method::HEAD => {}
        _ => {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, "GET, HEAD, OPTIONS")],
            )
                .into_response()
        }
    }

    let Some(path) = resolve_request_path(&state.root, uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match serve_file(&state.root, &path, &headers, method == Method::HEAD).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

async fn serve_file(
    root: &Path,
    path: &Path,
    headers: &HeaderMap,
    head_only: bool,
) -> Result<Response, StatusCode> {
    // Symlinks must not lead outside the root
    let real = tokio::fs::canonicalize(path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    if !real.starts_with(root) {
        return Err(StatusCode::NOT_FOUND);
    }

    let metadata = tokio::fs::metadata(&real)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    if !metadata.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }
    let file_size = metadata.len();

    let range = parse_range_header(
        headers.get(header::RANGE).and_then(|h| h.to_str().ok()),
        file_size,
    );

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(&real))
        .header(header::ACCEPT_RANGES, "bytes");

    let (builder, start) = match range {
        ByteRange::Unsatisfiable => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, unsatisfied_content_range(file_size))
                .body(Body::empty())
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
        }
        ByteRange::Full => (builder.status(StatusCode::OK), 0),
        ByteRange::Partial { start, end } => (
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, content_range(start, end, file_size)),
            start,
        ),
    };
    let length = range.len(file_size);
    let builder = builder.header(header::CONTENT_LENGTH, length.to_string());

    if head_only {
        return builder
            .body(Body::empty())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
    }

    let mut file = File::open(&real).await.map_err(|_| StatusCode::NOT_FOUND)?;
    if start > 0 {
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    }
    let body = Body::from_stream(ReaderStream::new(file.take(length)));

    builder
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
