// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use audioscribe_jobs::JobSystem;
use tokio_util::sync::CancellationToken;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Queue, workers, registry and progress hub.
    pub jobs: Arc<JobSystem>,
    /// Cancelled on shutdown so open event streams end.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(jobs: Arc<JobSystem>) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            jobs,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
