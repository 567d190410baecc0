//! Status module
//!
//! Provides the shared status snapshot served by the control API: per-job
//! views, aggregate counters and the addresses the media is reachable at.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job view exposed to pollers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub id: String,
    pub source_name: String,
    pub stream_key: String,
    pub state: String,
    pub reason: Option<String>,
    pub created_at_unix_ms: i64,
}

/// Complete status snapshot including jobs, addresses and aggregate stats
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub media_url: Option<String>,
    pub public_url: Option<String>,
    pub jobs: Vec<JobView>,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub succeeded_jobs: u64,
    pub failed_jobs: u64,
}

impl StatusSnapshot {
    /// Insert or replace a non-terminal job view, keyed by id
    pub fn upsert_job(&mut self, view: JobView) {
        if let Some(existing) = self.jobs.iter_mut().find(|j| j.id == view.id) {
            *existing = view;
        } else {
            self.jobs.push(view);
        }
        self.recount();
    }

    /// Drop a finished job from the active list and bump its counter
    pub fn finish_job(&mut self, view: &JobView) {
        self.jobs.retain(|j| j.id != view.id);
        match view.state.as_str() {
            "succeeded" => self.succeeded_jobs += 1,
            "failed" => self.failed_jobs += 1,
            _ => {}
        }
        self.recount();
    }

    /// Replace the active list with live views, oldest first
    pub fn replace_jobs(&mut self, views: Vec<JobView>) {
        self.jobs = views;
        self.recount();
    }

    fn recount(&mut self) {
        self.pending_jobs = self.jobs.iter().filter(|j| j.state == "pending").count();
        self.running_jobs = self.jobs.iter().filter(|j| j.state == "running").count();
        self.timestamp_unix_ms = now_unix_ms();
    }
}

/// Shared status state for concurrent access across service components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

/// Get current timestamp in milliseconds
pub fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
