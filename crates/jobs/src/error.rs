// crates/jobs/src/error.rs
use thiserror::Error;

use crate::types::{JobId, JobStatus};

/// Errors returned synchronously by the queue control surface.
///
/// None of these mutate queue state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Job already pending or running: {0}")]
    AlreadyActive(JobId),

    #[error("Job not active: {0}")]
    NotFound(JobId),

    #[error("Queue is stopped")]
    QueueStopped,
}

/// Errors raised by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found in store: {0}")]
    NotFound(JobId),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job store backend error: {0}")]
    Backend(String),
}

/// Errors that end a single job's execution.
///
/// These are recorded on the job (`lastError`) and never cross the worker boundary.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Failed to spawn transcriber `{program}`: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcriber failed: {message}")]
    ProcessExit {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Job canceled")]
    Canceled,

    #[error("{failed} of {total} tracks did not complete: {children}")]
    PartialFailure {
        failed: usize,
        total: usize,
        children: String,
    },

    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },
}

impl JobError {
    pub fn exit(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self::ProcessExit {
            exit_code,
            message: message.into(),
        }
    }
}

/// Invalid [`JobsConfig`](crate::config::JobsConfig) values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_messages() {
        let err = QueueError::AlreadyActive(JobId::new("rec-1"));
        assert_eq!(err.to_string(), "Job already pending or running: rec-1");
        let err = QueueError::NotFound(JobId::new("rec-2"));
        assert_eq!(err.to_string(), "Job not active: rec-2");
    }

    #[test]
    fn test_partial_failure_message() {
        let err = JobError::PartialFailure {
            failed: 1,
            total: 3,
            children: "rec.track1 (failed)".into(),
        };
        assert_eq!(
            err.to_string(),
            "1 of 3 tracks did not complete: rec.track1 (failed)"
        );
    }

    #[test]
    fn test_store_error_converts() {
        let err: JobError = StoreError::NotFound(JobId::new("x")).into();
        assert!(matches!(err, JobError::Store(StoreError::NotFound(_))));
    }
}
