// crates/server/src/error.rs
use audioscribe_jobs::{QueueError, StoreError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::JobNotFound(id) => {
                tracing::warn!(job_id = %id, "Job not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Job not found", format!("Job ID: {id}")),
                )
            }
            ApiError::Queue(queue_err) => {
                let (status, error_msg) = match queue_err {
                    QueueError::AlreadyActive(id) => {
                        tracing::warn!(job_id = %id, "Job already active");
                        (StatusCode::CONFLICT, "Job already pending or running")
                    }
                    QueueError::NotFound(id) => {
                        tracing::warn!(job_id = %id, "Job not active");
                        (StatusCode::NOT_FOUND, "Job not active")
                    }
                    QueueError::QueueStopped => {
                        tracing::warn!("Queue is stopped");
                        (StatusCode::SERVICE_UNAVAILABLE, "Queue is stopped")
                    }
                };
                (
                    status,
                    ErrorResponse::with_details(error_msg, queue_err.to_string()),
                )
            }
            ApiError::Store(store_err) => {
                let (status, error_msg) = match store_err {
                    StoreError::NotFound(id) => {
                        tracing::warn!(job_id = %id, "Job not found in store");
                        (StatusCode::NOT_FOUND, "Job not found")
                    }
                    StoreError::InvalidTransition { id, from, to } => {
                        tracing::warn!(job_id = %id, %from, %to, "Invalid status transition");
                        (StatusCode::CONFLICT, "Invalid status transition")
                    }
                    StoreError::Backend(message) => {
                        tracing::error!(message = %message, "Job store error");
                        (StatusCode::INTERNAL_SERVER_ERROR, "Job store error")
                    }
                };
                (
                    status,
                    ErrorResponse::with_details(error_msg, store_err.to_string()),
                )
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
            ApiError::Conflict(msg) => {
                tracing::warn!(message = %msg, "Conflict");
                (
                    StatusCode::CONFLICT,
                    ErrorResponse::with_details("Conflict", msg.clone()),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
