//! Control HTTP server
//!
//! JSON endpoints for browsing the catalog, requesting conversions and
//! polling their progress. Conversions never block a request; clients poll
//! `GET /jobs/:name` until the state is terminal.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::catalog::{CatalogError, Resolved, SourceAsset};
use crate::jobs::{JobError, JobHandle, JobState, TranscodeJobManager};
use crate::media_server::ServerError;
use crate::status::{JobView, SharedStatus, StatusSnapshot};

/// State shared by the control handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TranscodeJobManager>,
    pub status: SharedStatus,
}

/// One source as listed by `GET /catalog`
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub source: SourceAsset,
    pub ready: bool,
    pub job_state: Option<String>,
}

/// Body of `GET /jobs/:name`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStateView {
    pub source_name: String,
    pub state: String,
    pub reason: Option<String>,
}

impl JobStateView {
    fn new(source_name: &str, state: &JobState) -> Self {
        Self {
            source_name: source_name.to_string(),
            state: state.as_str().to_string(),
            reason: state.reason().map(String::from),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = match self {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::UnstreamableName(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        error_response(status, self.to_string())
    }
}

impl IntoResponse for CatalogError {
    fn into_response(self) -> Response {
        let status = match self {
            CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
            CatalogError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string())
    }
}

/// Handler for GET /catalog
async fn list_catalog(
    State(state): State<AppState>,
) -> Result<Json<Vec<CatalogEntry>>, CatalogError> {
    let scanned = state
        .manager
        .catalog()
        .run_blocking(|catalog| {
            catalog
                .list_sources()
                .into_iter()
                .map(|source| {
                    let ready = source
                        .stream_key
                        .as_deref()
                        .is_some_and(|key| catalog.is_ready(key));
                    (source, ready)
                })
                .collect::<Vec<_>>()
        })
        .await?;

    let mut entries = Vec::with_capacity(scanned.len());
    for (source, ready) in scanned {
        let job_state = state
            .manager
            .peek_job_state(&source.name)
            .await
            .map(|s| s.as_str().to_string());
        entries.push(CatalogEntry {
            source,
            ready,
            job_state,
        });
    }
    Ok(Json(entries))
}

/// Handler for GET /catalog/:name
async fn resolve_entry(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Resolved>, CatalogError> {
    state
        .manager
        .catalog()
        .run_blocking(move |catalog| catalog.resolve(&name))
        .await?
        .map(Json)
}

/// Handler for POST /jobs/:name
///
/// 200 when the asset is already published, 202 when a job is pending or running.
async fn ensure_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<JobView>), JobError> {
    let job = state.manager.ensure_streaming_asset(&name).await?;
    let view = job.view();
    let status = if job.state() == JobState::Succeeded {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(view)))
}

/// Handler for GET /jobs/:name
async fn get_job(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.manager.get_job_state(&name).await {
        Some(job_state) => Json(JobStateView::new(&name, &job_state)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("No job for '{}'", name)),
    }
}

/// Handler for GET /status
async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    let live: Vec<JobView> = state
        .manager
        .active_jobs()
        .await
        .iter()
        .map(JobHandle::view)
        .collect();
    let mut snapshot = state.status.read().await.clone();
    snapshot.replace_jobs(live);
    Json(snapshot)
}

/// Creates the axum Router with the control endpoints
pub fn create_control_router(state: AppState) -> Router {
    Router::new()
        .route("/catalog", get(list_catalog))
        .route("/catalog/:name", get(resolve_entry))
        .route("/jobs/:name", get(get_job).post(ensure_job))
        .route("/status", get(get_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Runs the control HTTP server on `addr`
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_control_server(addr: SocketAddr, state: AppState) -> Result<(), ServerError> {
    let app = create_control_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Control API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaCatalog;
    use crate::encode::Encoder;
    use crate::jobs::test_encoders::{FailingEncoder, FakeEncoder};
    use crate::status::new_shared_status;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state_with(temp: &TempDir, encoder: Arc<dyn Encoder>) -> AppState {
        let catalog = MediaCatalog::open(temp.path(), vec!["mp4".into(), "webm".into()]).unwrap();
        let status = new_shared_status();
        let manager = Arc::new(TranscodeJobManager::new(
            catalog,
            encoder,
            4,
            1,
            status.clone(),
        ));
        AppState { manager, status }
    }

    async fn call(state: &AppState, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = create_control_router(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    async fn poll_until_terminal(state: &AppState, uri: &str) -> serde_json::Value {
        for _ in 0..200 {
            let (status, json) = call(state, Method::GET, uri).await;
            assert_eq!(status, StatusCode::OK);
            if json["state"] == "succeeded" || json["state"] == "failed" {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn test_catalog_lists_sources_with_readiness() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.mp4"), b"a").unwrap();
        fs::write(temp.path().join("b.webm"), b"bb").unwrap();
        fs::write(temp.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(temp.path().join("a_stream")).unwrap();
        fs::write(temp.path().join("a_stream/playlist.m3u8"), "#EXTM3U\n").unwrap();

        let state = state_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)));
        let (status, json) = call(&state, Method::GET, "/catalog").await;

        assert_eq!(status, StatusCode::OK);
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["name"], "a.mp4");
        assert_eq!(entries[0]["ready"], true);
        assert_eq!(entries[1]["name"], "b.webm");
        assert_eq!(entries[1]["ready"], false);
        assert!(entries[1]["job_state"].is_null());
    }

    #[tokio::test]
    async fn test_resolve_unknown_name_is_404() {
        let temp = TempDir::new().unwrap();
        let state = state_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)));

        let (status, json) = call(&state, Method::GET, "/catalog/missing.mp4").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("missing.mp4"));
    }

    #[tokio::test]
    async fn test_resolve_percent_encoded_name() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("My Movie.mp4"), b"data").unwrap();
        let state = state_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)));

        let (status, json) = call(&state, Method::GET, "/catalog/My%20Movie.mp4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["source"]["name"], "My Movie.mp4");
        assert!(json["stream"].is_null());
    }

    #[tokio::test]
    async fn test_post_job_then_poll_to_success() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), b"data").unwrap();
        let state = state_with(&temp, Arc::new(FakeEncoder::new(2, Duration::from_millis(20))));

        let (status, json) = call(&state, Method::POST, "/jobs/clip.mp4").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["stream_key"], "clip");

        let done = poll_until_terminal(&state, "/jobs/clip.mp4").await;
        assert_eq!(done["state"], "succeeded");
        assert!(temp.path().join("clip_stream/playlist.m3u8").is_file());

        // Already published: 200 without a new job
        let (status, json) = call(&state, Method::POST, "/jobs/clip.mp4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "succeeded");
    }

    #[tokio::test]
    async fn test_failed_job_reports_reason() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), b"data").unwrap();
        let state = state_with(&temp, Arc::new(FailingEncoder { code: 1 }));

        let (status, _) = call(&state, Method::POST, "/jobs/clip.mp4").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let done = poll_until_terminal(&state, "/jobs/clip.mp4").await;
        assert_eq!(done["state"], "failed");
        assert!(done["reason"].as_str().unwrap().contains("exit code"));
    }

    #[tokio::test]
    async fn test_post_job_errors() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("!!!.mp4"), b"data").unwrap();
        let state = state_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)));

        let (status, _) = call(&state, Method::POST, "/jobs/missing.mp4").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = call(&state, Method::POST, "/jobs/%21%21%21.mp4").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_404() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), b"data").unwrap();
        let state = state_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)));

        let (status, _) = call(&state, Method::GET, "/jobs/clip.mp4").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let temp = TempDir::new().unwrap();
        let state = state_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)));
        state.status.write().await.media_url = Some("http://127.0.0.1:8000".to_string());

        let (status, json) = call(&state, Method::GET, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["media_url"], "http://127.0.0.1:8000");
        assert!(json["public_url"].is_null());
        assert_eq!(json["running_jobs"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_lists_live_jobs() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), b"data").unwrap();
        let state = state_with(&temp, Arc::new(FakeEncoder::new(10, Duration::from_millis(30))));

        let (status, posted) = call(&state, Method::POST, "/jobs/clip.mp4").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        // Stale snapshot entries never win over the job table
        state.status.write().await.jobs.clear();

        let (_, json) = call(&state, Method::GET, "/status").await;
        let jobs = json["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], posted["id"]);
        assert_eq!(json["pending_jobs"].as_u64().unwrap() + json["running_jobs"].as_u64().unwrap(), 1);

        poll_until_terminal(&state, "/jobs/clip.mp4").await;
        let (_, json) = call(&state, Method::GET, "/status").await;
        assert!(json["jobs"].as_array().unwrap().is_empty());
        assert_eq!(json["pending_jobs"], 0);
        assert_eq!(json["running_jobs"], 0);
    }

    #[tokio::test]
    async fn test_names_outside_root_are_404() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), b"data").unwrap();
        fs::create_dir(temp.path().join("clip_stream")).unwrap();
        fs::write(temp.path().join("clip_stream/playlist.m3u8"), "#EXTM3U\n").unwrap();
        let state = state_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)));

        for uri in ["/catalog/..%2Fclip.mp4", "/jobs/..%2Fclip.mp4", "/jobs/sub%2Fclip.mp4"] {
            let (status, _) = call(&state, Method::GET, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "GET {}", uri);
        }
        for uri in ["/jobs/..%2Fclip.mp4", "/jobs/sub%2Fclip.mp4"] {
            let (status, _) = call(&state, Method::POST, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "POST {}", uri);
        }
    }
}
