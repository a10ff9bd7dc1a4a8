// crates/jobs/src/types.rs
//! Types shared by the queue, the processor, and the progress hub.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-assigned job identifier, stable for the job's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Single,
    MultiTrack,
}

/// Lifecycle status of a job.
///
/// `Pending -> Running -> {Completed, Failed, Canceled}`; nothing re-enters `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audio stream of a multi-track recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInput {
    pub label: String,
    pub audio_path: PathBuf,
}

/// Input descriptor handed to the transcription executable on stdin.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInput {
    pub audio_path: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<TrackInput>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl JobInput {
    pub fn new(audio_path: impl Into<PathBuf>) -> Self {
        Self {
            audio_path: audio_path.into(),
            ..Default::default()
        }
    }
}

/// Durable job record as held by a [`JobStore`](crate::store::JobStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(default)]
    pub sub_job_ids: Vec<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub input: JobInput,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh pending single-track job.
    pub fn single(id: impl Into<JobId>, input: JobInput) -> Self {
        Self::with_kind(id.into(), JobKind::Single, input)
    }

    /// A fresh pending multi-track job; one child is created per entry in `input.tracks`.
    pub fn multi_track(id: impl Into<JobId>, input: JobInput) -> Self {
        Self::with_kind(id.into(), JobKind::MultiTrack, input)
    }

    fn with_kind(id: JobId, kind: JobKind, input: JobInput) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            status: JobStatus::Pending,
            progress: 0.0,
            sub_job_ids: Vec::new(),
            parent_id: None,
            last_error: None,
            input,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Description of one child job created by the multi-track orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildJobSpec {
    pub label: String,
    pub input: JobInput,
}

/// Message type of a [`JobEvent`], used as the SSE event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Progress,
    Result,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

/// Live update delivered through the progress hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl JobEvent {
    fn base(job_id: &JobId, kind: EventKind, status: JobStatus, progress: f64) -> Self {
        Self {
            job_id: job_id.clone(),
            kind,
            status,
            progress,
            stage: None,
            result: None,
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn status(job_id: &JobId, status: JobStatus, progress: f64) -> Self {
        Self::base(job_id, EventKind::Status, status, progress)
    }

    pub fn progress(job_id: &JobId, progress: f64, stage: Option<String>) -> Self {
        Self {
            stage,
            ..Self::base(job_id, EventKind::Progress, JobStatus::Running, progress)
        }
    }

    pub fn result(job_id: &JobId, result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::base(job_id, EventKind::Result, JobStatus::Completed, 1.0)
        }
    }

    pub fn error(job_id: &JobId, progress: f64, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(job_id, EventKind::Error, JobStatus::Failed, progress)
        }
    }

    pub fn canceled(job_id: &JobId, progress: f64) -> Self {
        Self::status(job_id, JobStatus::Canceled, progress)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Jobs admitted but not yet handed to a worker.
    pub waiting: usize,
    /// Jobs held by workers.
    pub active: usize,
    pub workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_job_kind_serialize() {
        assert_eq!(serde_json::to_string(&JobKind::MultiTrack).unwrap(), "\"multitrack\"");
        assert_eq!(serde_json::to_string(&JobKind::Single).unwrap(), "\"single\"");
    }

    #[test]
    fn test_job_event_serialize() {
        let event = JobEvent::progress(&JobId::new("rec-1"), 0.5, Some("diarize".into()));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"jobId\":\"rec-1\""));
        assert!(json.contains("\"type\":\"progress\""));
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"stage\":\"diarize\""));
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn test_terminal_events() {
        let id = JobId::new("rec-2");
        assert!(JobEvent::result(&id, serde_json::json!({"text": "hi"})).is_terminal());
        assert!(JobEvent::error(&id, 0.3, "boom").is_terminal());
        assert!(JobEvent::canceled(&id, 0.3).is_terminal());
        assert!(!JobEvent::status(&id, JobStatus::Running, 0.0).is_terminal());
    }

    #[test]
    fn test_job_input_defaults_when_deserializing() {
        let input: JobInput = serde_json::from_str(r#"{"audioPath":"/tmp/a.wav"}"#).unwrap();
        assert_eq!(input.audio_path, PathBuf::from("/tmp/a.wav"));
        assert!(input.tracks.is_empty());
        assert!(input.params.is_null());
    }
}
