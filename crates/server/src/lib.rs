// crates/server/src/lib.rs
//! HTTP adapter over the audioscribe job queue.
//!
//! Exposes the queue control surface as JSON endpoints and job progress as
//! server-sent events.

pub mod error;
pub mod routes;
pub mod state;

pub use error::*;
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};

/// Create the Axum application with all routes and middleware.
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(cors)
        .layer(audioscribe_observability::http_trace_layer())
}
