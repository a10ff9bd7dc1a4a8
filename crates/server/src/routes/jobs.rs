// crates/server/src/routes/jobs.rs
//! API routes over the transcription job queue.
//!
//! - POST /jobs — Create a job record and enqueue it
//! - GET /jobs/stats — Queue statistics
//! - GET /jobs/stream — SSE stream of every job's events
//! - GET /jobs/{id} — Job record, activity flag and result
//! - POST /jobs/{id}/enqueue — (Re-)enqueue an existing job
//! - POST /jobs/{id}/kill — Cancel a waiting or running job
//! - GET /jobs/{id}/stream — SSE stream of one job until it ends

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use audioscribe_jobs::{
    Job, JobEvent, JobId, JobInput, JobStatus, QueueStats, StoreError, TrackInput,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Body of `POST /api/jobs`. A non-empty `tracks` list makes a multi-track job.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub audio_path: Option<PathBuf>,
    #[serde(default)]
    pub tracks: Vec<TrackInput>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl CreateJobRequest {
    fn into_job(self) -> ApiResult<Job> {
        let id = match self.id {
            Some(id) if id.trim().is_empty() || id.contains(char::is_whitespace) => {
                return Err(ApiError::BadRequest(format!("invalid job id {id:?}")));
            }
            Some(id) => id,
            None => ulid::Ulid::new().to_string().to_lowercase(),
        };
        if self
            .tracks
            .iter()
            .any(|track| track.audio_path.as_os_str().is_empty())
        {
            return Err(ApiError::BadRequest("every track needs an audioPath".into()));
        }

        let audio_path = self.audio_path.unwrap_or_default();
        let input = JobInput {
            audio_path,
            tracks: self.tracks,
            params: self.params,
        };
        if input.tracks.is_empty() {
            if input.audio_path.as_os_str().is_empty() {
                return Err(ApiError::BadRequest("audioPath is required".into()));
            }
            Ok(Job::single(id, input))
        } else {
            Ok(Job::multi_track(id, input))
        }
    }
}

/// A job as returned by the API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    /// Waiting in the backlog or held by a worker.
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub job_id: JobId,
    pub stats: QueueStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillResponse {
    pub job_id: JobId,
    pub kill_requested: bool,
}

/// POST /api/jobs - Create and enqueue a job.
async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = request.into_job()?;
    let store = state.jobs.store();
    store.insert_job(job.clone()).await.map_err(|e| match e {
        StoreError::Backend(msg) => ApiError::Conflict(msg),
        other => ApiError::Store(other),
    })?;
    state.jobs.queue().enqueue_job(&job.id)?;
    tracing::info!(job_id = %job.id, kind = ?job.kind, "Job created");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /api/jobs/{id} - Job record with result, if any.
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job_id = JobId::new(id);
    let store = state.jobs.store();
    let job = store.get_job(&job_id).await.map_err(|e| match e {
        StoreError::NotFound(id) => ApiError::JobNotFound(id.to_string()),
        other => ApiError::Store(other),
    })?;
    let result = store.get_result(&job_id).await?;
    Ok(Json(JobView {
        active: state.jobs.queue().is_job_running(&job_id),
        job,
        result,
    }))
}

/// POST /api/jobs/{id}/enqueue - Enqueue an existing job record.
async fn enqueue_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<QueuedResponse>)> {
    let job_id = JobId::new(id);
    if let Err(StoreError::NotFound(_)) = state.jobs.store().get_job(&job_id).await {
        return Err(ApiError::JobNotFound(job_id.to_string()));
    }
    let queue = state.jobs.queue();
    queue.enqueue_job(&job_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            job_id,
            stats: queue.queue_stats(),
        }),
    ))
}

/// POST /api/jobs/{id}/kill - Cancel a job; completion shows up on the stream.
async fn kill_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<KillResponse>)> {
    let job_id = JobId::new(id);
    state.jobs.queue().kill_job(&job_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(KillResponse {
            job_id,
            kill_requested: true,
        }),
    ))
}

/// GET /api/jobs/stats - Waiting and active counts.
async fn queue_stats(State(state): State<Arc<AppState>>) -> Json<QueueStats> {
    Json(state.jobs.queue().queue_stats())
}

fn sse_event(event: &JobEvent) -> Event {
    let json = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.kind.as_str()).data(json)
}

/// The event a finished job would have ended its stream with.
fn terminal_event(job: &Job, result: Option<serde_json::Value>) -> Option<JobEvent> {
    match job.status {
        JobStatus::Completed => Some(JobEvent::result(
            &job.id,
            result.unwrap_or(serde_json::Value::Null),
        )),
        JobStatus::Failed => Some(JobEvent::error(
            &job.id,
            job.progress,
            job.last_error.clone().unwrap_or_else(|| "failed".into()),
        )),
        JobStatus::Canceled => Some(JobEvent::canceled(&job.id, job.progress)),
        JobStatus::Pending | JobStatus::Running => None,
    }
}

/// GET /api/jobs/{id}/stream - SSE stream of one job's events.
///
/// A job that already finished gets its final event and the stream ends.
async fn stream_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let job_id = JobId::new(id);
    // Subscribe before reading the store so nothing slips between the two.
    let subscription = state.jobs.hub().subscribe(&job_id);
    let store = state.jobs.store();
    let job = store.get_job(&job_id).await.map_err(|e| match e {
        StoreError::NotFound(id) => ApiError::JobNotFound(id.to_string()),
        other => ApiError::Store(other),
    })?;
    let finished = if job.status.is_terminal() && !state.jobs.queue().is_job_running(&job_id) {
        terminal_event(&job, store.get_result(&job_id).await?)
    } else {
        None
    };
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        if let Some(event) = finished {
            yield Ok::<_, Infallible>(sse_event(&event));
        } else {
            let mut subscription = subscription;
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    next = subscription.next() => next,
                };
                match next {
                    Some(event) => yield Ok(sse_event(&event)),
                    None => break,
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/jobs/stream - SSE stream of every job's events.
async fn stream_all_jobs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.jobs.hub().subscribe_all();
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        let mut rx = rx;
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => received,
            };
            match received {
                Ok(event) => yield Ok::<_, Infallible>(sse_event(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Job stream subscriber lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Build the jobs router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/stats", get(queue_stats))
        .route("/jobs/stream", get(stream_all_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/enqueue", post(enqueue_job))
        .route("/jobs/{id}/kill", post(kill_job))
        .route("/jobs/{id}/stream", get(stream_job))
}
