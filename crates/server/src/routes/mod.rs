//! API route handlers for the audioscribe server.

pub mod health;
pub mod jobs;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined API router with all routes under /api prefix.
///
/// Routes:
/// - GET  /api/health - Health check
/// - POST /api/jobs - Create and enqueue a job
/// - GET  /api/jobs/stats - Queue statistics
/// - GET  /api/jobs/stream - SSE stream of all job events
/// - GET  /api/jobs/{id} - Job record and result
/// - POST /api/jobs/{id}/enqueue - Enqueue an existing job
/// - POST /api/jobs/{id}/kill - Cancel a job
/// - GET  /api/jobs/{id}/stream - SSE stream of one job
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", jobs::router())
        .with_state(state)
}
