//! Transcode job manager.
//!
//! Turns a raw source into a streaming asset by running the external encoder
//! on a blocking thread. At most one job per stream key is pending or running
//! at a time; a bounded semaphore caps how many encoders run overall.

use crate::catalog::{is_plain_file_name, stream_key, MediaCatalog, MANIFEST_FILE_NAME};
use crate::encode::hls::verify_manifest;
use crate::encode::{EncodeRequest, Encoder};
use crate::publish::{create_staging, publish, stale_dir};
use crate::status::{now_unix_ms, JobView, SharedStatus};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use uuid::Uuid;

/// Errors returned when a conversion cannot even be started
#[derive(Debug, Error)]
pub enum JobError {
    /// No raw source and no prepared asset exist for the name
    #[error("Source not found: {0}")]
    NotFound(String),

    /// The base name sanitizes to an empty string
    #[error("Source name '{0}' has no usable characters for a stream directory")]
    UnstreamableName(String),
}

/// Job state. Transitions only move forward:
/// Pending -> Running -> Succeeded | Failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for a worker slot
    Pending,
    /// Encoder is running
    Running,
    /// Asset is published
    Succeeded,
    /// Encoder or publishing failed
    Failed(String),
}

impl JobState {
    /// Convert state to string for status views
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            JobState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Succeeded | JobState::Failed(_) => 2,
        }
    }
}

#[derive(Debug)]
struct TranscodeJob {
    id: String,
    source_name: String,
    key: String,
    created_at_unix_ms: i64,
    state: watch::Sender<JobState>,
}

/// Shared handle to an in-flight or finished job
#[derive(Debug, Clone)]
pub struct JobHandle(Arc<TranscodeJob>);

impl JobHandle {
    fn new(source_name: &str, key: &str, state: JobState) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self(Arc::new(TranscodeJob {
            id: Uuid::new_v4().to_string(),
            source_name: source_name.to_string(),
            key: key.to_string(),
            created_at_unix_ms: now_unix_ms(),
            state: tx,
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn source_name(&self) -> &str {
        &self.0.source_name
    }

    pub fn stream_key(&self) -> &str {
        &self.0.key
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.0.state.borrow().clone()
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.0.state.subscribe()
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self) -> JobState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => state.clone(),
            // The sender lives inside self, so it cannot be dropped here
            Err(_) => self.state(),
        };
        state
    }

    /// Status view of the current state
    pub fn view(&self) -> JobView {
        let state = self.state();
        JobView {
            id: self.0.id.clone(),
            source_name: self.0.source_name.clone(),
            stream_key: self.0.key.clone(),
            state: state.as_str().to_string(),
            reason: state.reason().map(String::from),
            created_at_unix_ms: self.0.created_at_unix_ms,
        }
    }

    /// Move to `next` if it is strictly later than the current state
    fn advance(&self, next: JobState) -> bool {
        self.0.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

#[derive(Default)]
struct JobTable {
    /// Pending or running jobs by stream key
    active: HashMap<String, JobHandle>,
    /// Terminal states not yet observed through `get_job_state`
    finished: HashMap<String, JobState>,
}

/// Creates, deduplicates and runs transcode jobs
pub struct TranscodeJobManager {
    catalog: MediaCatalog,
    encoder: Arc<dyn Encoder>,
    segment_duration_secs: u32,
    semaphore: Arc<Semaphore>,
    jobs: Mutex<JobTable>,
    status: SharedStatus,
}

impl TranscodeJobManager {
    /// Create a manager running at most `max_concurrent_jobs` encoders at once
    pub fn new(
        catalog: MediaCatalog,
        encoder: Arc<dyn Encoder>,
        segment_duration_secs: u32,
        max_concurrent_jobs: usize,
        status: SharedStatus,
    ) -> Self {
        Self {
            catalog,
            encoder,
            segment_duration_secs,
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            jobs: Mutex::new(JobTable::default()),
            status,
        }
    }

    pub fn catalog(&self) -> &MediaCatalog {
        &self.catalog
    }

    /// Make sure a streaming asset exists for `source_name`.
    ///
    /// - Asset already published: returns a handle already `Succeeded`
    /// - Job already pending/running for the same key: returns that job
    /// - Otherwise starts a new job and returns its handle immediately
    ///
    /// The lookup and the insertion happen under one lock, so concurrent
    /// callers for the same key never start two encoders.
    pub async fn ensure_streaming_asset(
        self: &Arc<Self>,
        source_name: &str,
    ) -> Result<JobHandle, JobError> {
        if !is_plain_file_name(source_name) {
            return Err(JobError::NotFound(source_name.to_string()));
        }
        let key = stream_key(source_name)
            .ok_or_else(|| JobError::UnstreamableName(source_name.to_string()))?;

        let mut table = self.jobs.lock().await;

        if let Some(existing) = table.active.get(&key) {
            tracing::debug!(source = %source_name, job_id = %existing.id(), "Joining running job");
            return Ok(existing.clone());
        }

        // The table stays locked across the lookup so no second job slips in
        let name = source_name.to_string();
        let (ready, source_exists) = self
            .catalog
            .run_blocking(move |catalog| match catalog.resolve(&name) {
                Ok(resolved) => (resolved.is_ready(), resolved.source.is_some()),
                Err(_) => (false, false),
            })
            .await
            .unwrap_or((false, false));

        if ready {
            return Ok(JobHandle::new(source_name, &key, JobState::Succeeded));
        }
        if !source_exists {
            return Err(JobError::NotFound(source_name.to_string()));
        }

        let handle = JobHandle::new(source_name, &key, JobState::Pending);
        table.finished.remove(&key);
        table.active.insert(key, handle.clone());
        drop(table);

        tracing::info!(source = %source_name, job_id = %handle.id(), "Queued transcode job");
        self.status.write().await.upsert_job(handle.view());

        let manager = Arc::clone(self);
        let job = handle.clone();
        tokio::spawn(async move {
            manager.run_job(job).await;
        });

        Ok(handle)
    }

    /// Latest known state for a source.
    ///
    /// A terminal state is handed out once and then forgotten; afterwards a
    /// published asset still reports `Succeeded` from disk.
    pub async fn get_job_state(&self, source_name: &str) -> Option<JobState> {
        if !is_plain_file_name(source_name) {
            return None;
        }
        let key = stream_key(source_name)?;
        {
            let mut table = self.jobs.lock().await;
            if let Some(handle) = table.active.get(&key) {
                return Some(handle.state());
            }
            if let Some(state) = table.finished.remove(&key) {
                return Some(state);
            }
        }
        self.catalog
            .run_blocking(move |catalog| catalog.is_ready(&key))
            .await
            .unwrap_or(false)
            .then_some(JobState::Succeeded)
    }

    /// State of the active job for a source without consuming anything
    pub async fn peek_job_state(&self, source_name: &str) -> Option<JobState> {
        if !is_plain_file_name(source_name) {
            return None;
        }
        let key = stream_key(source_name)?;
        let table = self.jobs.lock().await;
        table
            .active
            .get(&key)
            .map(JobHandle::state)
            .or_else(|| table.finished.get(&key).cloned())
    }

    /// Handles of all pending and running jobs
    pub async fn active_jobs(&self) -> Vec<JobHandle> {
        let table = self.jobs.lock().await;
        let mut jobs: Vec<JobHandle> = table.active.values().cloned().collect();
        jobs.sort_by_key(|j| j.0.created_at_unix_ms);
        jobs
    }

    async fn run_job(self: Arc<Self>, job: JobHandle) {
        let terminal = match self.execute(&job).await {
            Ok(()) => {
                tracing::info!(source = %job.source_name(), job_id = %job.id(), "Transcode job succeeded");
                JobState::Succeeded
            }
            Err(reason) => {
                tracing::error!(
                    source = %job.source_name(),
                    job_id = %job.id(),
                    reason = %reason,
                    "Transcode job failed"
                );
                JobState::Failed(reason)
            }
        };

        {
            let mut table = self.jobs.lock().await;
            job.advance(terminal.clone());
            table.active.remove(job.stream_key());
            table.finished.insert(job.stream_key().to_string(), terminal);
        }

        self.status.write().await.finish_job(&job.view());
    }

    /// Encode into a staging directory, verify, then publish by rename
    async fn execute(&self, job: &JobHandle) -> Result<(), String> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| format!("Worker pool closed: {}", e))?;

        job.advance(JobState::Running);
        self.status.write().await.upsert_job(job.view());

        let root = self.catalog.root().to_path_buf();
        let key = job.stream_key().to_string();
        let job_id = job.id().to_string();
        let source = self.catalog.source_path(job.source_name());
        let target = self.catalog.stream_dir(&key);
        let segment_duration_secs = self.segment_duration_secs;
        let encoder = Arc::clone(&self.encoder);

        tokio::task::spawn_blocking(move || -> Result<(), String> {
            let staging = create_staging(&root, &key, &job_id).map_err(|e| e.to_string())?;
            let request = EncodeRequest::new(
                source,
                staging.join(MANIFEST_FILE_NAME),
                segment_duration_secs,
            );
            // Staging directory is kept for inspection when this fails
            encoder
                .encode(&request)
                .and_then(|()| verify_manifest(&request.output_manifest_path))
                .map_err(|e| e.to_string())?;

            let stale = stale_dir(&root, &key, &job_id);
            publish(&staging, &target, &stale).map_err(|e| e.to_string())
        })
        .await
        .map_err(|join_err| format!("Encoding task panicked: {}", join_err))?
    }
}


#[cfg(test)]
mod tests {
    use super::test_encoders::{FailingEncoder, FakeEncoder};
    use super::*;
    use crate::status::new_shared_status;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager_with(
        temp: &TempDir,
        encoder: Arc<dyn Encoder>,
        max_jobs: usize,
    ) -> Arc<TranscodeJobManager> {
        let catalog = MediaCatalog::open(
            temp.path(),
            vec!["mp4".into(), "webm".into(), "ogg".into(), "mov".into()],
        )
        .unwrap();
        Arc::new(TranscodeJobManager::new(
            catalog,
            encoder,
            4,
            max_jobs,
            new_shared_status(),
        ))
    }

    fn add_source(root: &Path, name: &str) {
        fs::write(root.join(name), vec![0u8; 1024]).unwrap();
    }

    /// Every segment named in the manifest exists next to it
    fn assert_manifest_complete(manifest: &Path) {
        let text = fs::read_to_string(manifest).unwrap();
        assert!(text.contains("#EXT-X-ENDLIST"));
        let dir = manifest.parent().unwrap();
        for line in text.lines().filter(|l| !l.starts_with('#') && !l.is_empty()) {
            assert!(dir.join(line).is_file(), "segment {} missing", line);
        }
    }

    #[test]
    fn test_job_state_as_str() {
        assert_eq!(JobState::Pending.as_str(), "pending");
        assert_eq!(JobState::Running.as_str(), "running");
        assert_eq!(JobState::Succeeded.as_str(), "succeeded");
        assert_eq!(JobState::Failed("error".to_string()).as_str(), "failed");
    }

    #[test]
    fn test_job_state_never_regresses() {
        let job = JobHandle::new("clip.mp4", "clip", JobState::Pending);

        assert!(job.advance(JobState::Running));
        assert!(!job.advance(JobState::Pending));
        assert!(job.advance(JobState::Succeeded));
        assert!(!job.advance(JobState::Failed("late".to_string())));
        assert!(!job.advance(JobState::Running));
        assert_eq!(job.state(), JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_state() {
        let job = JobHandle::new("clip.mp4", "clip", JobState::Pending);
        let waiter = job.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        job.advance(JobState::Running);
        job.advance(JobState::Failed("boom".to_string()));

        assert_eq!(task.await.unwrap(), JobState::Failed("boom".to_string()));
    }

    #[tokio::test]
    async fn test_ready_asset_is_fast_path() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "clip.mp4");
        let dir = temp.path().join("clip_stream");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("playlist.m3u8"), "#EXTM3U\n").unwrap();

        let encoder = Arc::new(FakeEncoder::new(1, Duration::ZERO));
        let manager = manager_with(&temp, encoder.clone(), 1);

        let job = manager.ensure_streaming_asset("clip.mp4").await.unwrap();
        assert_eq!(job.state(), JobState::Succeeded);
        assert_eq!(encoder.calls(), 0);
        assert_eq!(manager.get_job_state("clip.mp4").await, Some(JobState::Succeeded));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_encode() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "x.mp4");
        let encoder = Arc::new(FakeEncoder::new(3, Duration::from_millis(50)));
        let manager = manager_with(&temp, encoder.clone(), 2);

        let (a, b) = tokio::join!(
            manager.ensure_streaming_asset("x.mp4"),
            manager.ensure_streaming_asset("x.mp4"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id(), b.id());

        let (state_a, state_b) = tokio::join!(a.wait(), b.wait());
        assert_eq!(state_a, JobState::Succeeded);
        assert_eq!(state_a, state_b);
        assert_eq!(encoder.calls(), 1);

        // A later request takes the fast path
        let again = manager.ensure_streaming_asset("x.mp4").await.unwrap();
        assert_eq!(again.state(), JobState::Succeeded);
        assert_eq!(encoder.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_requests_single_encoder_invocation() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "x.mp4");
        let encoder = Arc::new(FakeEncoder::new(2, Duration::from_millis(30)));
        let manager = manager_with(&temp, encoder.clone(), 4);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let job = manager.ensure_streaming_asset("x.mp4").await.unwrap();
                job.wait().await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), JobState::Succeeded);
        }
        assert_eq!(encoder.calls(), 1);
    }

    /// GET the manifest through the media server. `None` on 404.
    async fn fetch_manifest(root: &Path) -> Option<String> {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        let response = crate::media_server::create_media_router(root.to_path_buf())
            .oneshot(
                Request::builder()
                    .uri("/clip_stream/playlist.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        if response.status() == StatusCode::NOT_FOUND {
            return None;
        }
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        Some(String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manifest_invisible_until_published() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "clip.mp4");
        let encoder = Arc::new(FakeEncoder::new(5, Duration::from_millis(40)));
        let manager = manager_with(&temp, encoder, 1);

        let job = manager.ensure_streaming_asset("clip.mp4").await.unwrap();
        let manifest = temp.path().join("clip_stream").join("playlist.m3u8");

        let mut served_while_running = 0;
        while !job.state().is_terminal() {
            // Either nothing is visible yet, or the complete asset is
            if manifest.exists() {
                assert_manifest_complete(&manifest);
            }
            match fetch_manifest(temp.path()).await {
                None => served_while_running += 1,
                Some(text) => {
                    assert!(text.contains("#EXT-X-ENDLIST"), "served partial manifest: {}", text);
                    assert_manifest_complete(&manifest);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(served_while_running > 0);
        assert_eq!(job.state(), JobState::Succeeded);
        assert_manifest_complete(&manifest);
        let served = fetch_manifest(temp.path()).await.unwrap();
        assert_eq!(served.lines().filter(|l| l.ends_with(".ts")).count(), 5);
        assert!(manager.catalog().resolve("clip.mp4").unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_names_outside_root_are_not_found() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "clip.mp4");
        let dir = temp.path().join("clip_stream");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("playlist.m3u8"), "#EXTM3U\n").unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        add_source(&temp.path().join("sub"), "clip.mp4");

        let encoder = Arc::new(FakeEncoder::new(1, Duration::ZERO));
        let manager = manager_with(&temp, encoder.clone(), 1);

        for name in ["../clip.mp4", "sub/clip.mp4", "sub\\clip.mp4"] {
            let err = manager.ensure_streaming_asset(name).await.unwrap_err();
            assert!(matches!(err, JobError::NotFound(_)), "{}: {:?}", name, err);
            assert_eq!(manager.get_job_state(name).await, None);
            assert_eq!(manager.peek_job_state(name).await, None);
        }
        assert_eq!(encoder.calls(), 0);
        assert!(manager.active_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_staging_kept() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "bad.mp4");
        let manager = manager_with(&temp, Arc::new(FailingEncoder { code: 1 }), 1);

        let job = manager.ensure_streaming_asset("bad.mp4").await.unwrap();
        let state = job.wait().await;

        assert_eq!(state.as_str(), "failed");
        assert!(state.reason().unwrap().contains("exit code: 1"));
        assert!(!temp.path().join("bad_stream").exists());

        let staging = crate::publish::staging_dir(temp.path(), "bad", job.id());
        assert!(staging.join("segment_000.ts").is_file());

        // Terminal state is observed once, then forgotten
        assert_eq!(manager.get_job_state("bad.mp4").await, Some(state));
        assert_eq!(manager.get_job_state("bad.mp4").await, None);
    }

    #[tokio::test]
    async fn test_failed_job_is_not_retried_automatically() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "bad.mp4");
        let manager = manager_with(&temp, Arc::new(FailingEncoder { code: 2 }), 1);

        let first = manager.ensure_streaming_asset("bad.mp4").await.unwrap();
        first.wait().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.active_jobs().await.is_empty());

        // Caller decides to retry: a brand-new job
        let second = manager.ensure_streaming_asset("bad.mp4").await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(second.wait().await.reason().is_some());
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let temp = TempDir::new().unwrap();
        let manager = manager_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)), 1);

        let err = manager.ensure_streaming_asset("nope.mp4").await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
        assert_eq!(manager.get_job_state("nope.mp4").await, None);
    }

    #[tokio::test]
    async fn test_unstreamable_name_is_rejected() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "###.mp4");
        let manager = manager_with(&temp, Arc::new(FakeEncoder::new(1, Duration::ZERO)), 1);

        let err = manager.ensure_streaming_asset("###.mp4").await.unwrap_err();
        assert!(matches!(err, JobError::UnstreamableName(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_bounds_concurrent_encoders() {
        let temp = TempDir::new().unwrap();
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            add_source(temp.path(), name);
        }
        let encoder = Arc::new(FakeEncoder::new(3, Duration::from_millis(30)));
        let manager = manager_with(&temp, encoder.clone(), 1);

        let mut jobs = Vec::new();
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            jobs.push(manager.ensure_streaming_asset(name).await.unwrap());
        }
        for job in &jobs {
            assert_eq!(job.wait().await, JobState::Succeeded);
        }

        assert_eq!(encoder.calls(), 3);
        assert_eq!(encoder.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(encoder.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_status_tracks_outcomes() {
        let temp = TempDir::new().unwrap();
        add_source(temp.path(), "good.mp4");
        let status = new_shared_status();
        let catalog = MediaCatalog::open(temp.path(), vec!["mp4".into()]).unwrap();
        let manager = Arc::new(TranscodeJobManager::new(
            catalog,
            Arc::new(FakeEncoder::new(1, Duration::ZERO)),
            4,
            1,
            status.clone(),
        ));

        let job = manager.ensure_streaming_asset("good.mp4").await.unwrap();
        job.wait().await;
        // finish_job runs right after the terminal transition
        for _ in 0..50 {
            if status.read().await.succeeded_jobs == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let snapshot = status.read().await;
        assert_eq!(snapshot.succeeded_jobs, 1);
        assert_eq!(snapshot.failed_jobs, 0);
        assert!(snapshot.jobs.is_empty());
    }
}
