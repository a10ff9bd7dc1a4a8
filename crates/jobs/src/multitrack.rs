// crates/jobs/src/multitrack.rs
//! Multi-Track Orchestrator.
//!
//! A multi-track job fans out into one ordinary child job per track. The
//! parent keeps its worker while the children run through the same queue,
//! folds their events into a mean progress, and ends `failed` if any child
//! did not complete. Completed children keep their own results.

use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, QueueError};
use crate::hub::{ProgressHub, Subscription};
use crate::processor::{record_canceled, record_completed, record_failure, JobOutcome};
use crate::queue::JobQueue;
use crate::store::JobStore;
use crate::types::{ChildJobSpec, JobEvent, JobId, JobInput, JobStatus};

type EventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

pub struct MultiTrackOrchestrator {
    store: Arc<dyn JobStore>,
    hub: Arc<ProgressHub>,
    queue: Weak<dyn JobQueue>,
}

impl MultiTrackOrchestrator {
    pub fn new(store: Arc<dyn JobStore>, hub: Arc<ProgressHub>, queue: Weak<dyn JobQueue>) -> Self {
        Self { store, hub, queue }
    }

    /// Whether `job_id` is a composite job. Unknown jobs are not.
    pub async fn is_multi_track_job(&self, job_id: &JobId) -> bool {
        match self.store.is_multi_track(job_id).await {
            Ok(composite) => composite,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not classify job");
                false
            }
        }
    }

    /// Run a composite job until every child is terminal (or the parent is canceled).
    pub async fn process_job(&self, cancel: &CancellationToken, parent_id: &JobId) -> JobOutcome {
        let mut tracker = None;
        let result = self.orchestrate(cancel, parent_id, &mut tracker).await;
        let progress = tracker.as_ref().map_or(0.0, ChildTracker::reported);
        match result {
            Ok(value) => record_completed(&*self.store, &self.hub, parent_id, value, progress).await,
            Err(JobError::Canceled) => {
                if let Some(tracker) = &tracker {
                    self.cancel_children(&tracker.ids).await;
                }
                record_canceled(&*self.store, &self.hub, parent_id, progress).await
            }
            Err(e) => {
                // Tracks still running must not outlive their parent's slot.
                if let Some(tracker) = &tracker {
                    self.cancel_children(&tracker.ids).await;
                }
                record_failure(&*self.store, &self.hub, parent_id, progress, &e).await
            }
        }
    }

    /// Cancel a composite job and all of its unfinished children, returning
    /// once every child and the parent are terminal.
    pub async fn terminate_multi_track_job(&self, parent_id: &JobId) -> Result<(), JobError> {
        let queue = self.queue()?;
        if queue.is_job_running(parent_id) {
            // The parent's worker cancels the children and records the parent.
            let mut watch = self.hub.subscribe(parent_id);
            match queue.kill_job(parent_id).await {
                Ok(()) | Err(QueueError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.wait_terminal(parent_id, &mut watch).await;
            return Ok(());
        }

        let parent = self.store.get_job(parent_id).await?;
        self.cancel_children(&parent.sub_job_ids).await;
        if !parent.status.is_terminal() {
            record_canceled(&*self.store, &self.hub, parent_id, parent.progress).await;
        }
        Ok(())
    }

    async fn orchestrate(
        &self,
        cancel: &CancellationToken,
        parent_id: &JobId,
        tracker_slot: &mut Option<ChildTracker>,
    ) -> Result<serde_json::Value, JobError> {
        let queue = self.queue()?;
        if cancel.is_cancelled() {
            return Err(JobError::Canceled);
        }
        let parent = self.store.get_job(parent_id).await?;
        if parent.input.tracks.is_empty() {
            return Err(JobError::InvalidInput(format!(
                "multi-track job {parent_id} has no tracks"
            )));
        }
        self.store
            .update_status(parent_id, JobStatus::Running, None)
            .await?;
        self.hub
            .publish(JobEvent::status(parent_id, JobStatus::Running, 0.0));

        let specs = parent
            .input
            .tracks
            .iter()
            .map(|track| ChildJobSpec {
                label: track.label.clone(),
                input: JobInput {
                    audio_path: track.audio_path.clone(),
                    tracks: Vec::new(),
                    params: parent.input.params.clone(),
                },
            })
            .collect();
        let children = self.store.create_child_jobs(parent_id, specs).await?;
        tracing::info!(job_id = %parent_id, tracks = children.len(), "Fanning out multi-track job");

        let tracker = tracker_slot.insert(ChildTracker::new(children.clone()));

        // Subscribe before enqueueing so no child event is missed.
        let mut events: StreamMap<usize, EventStream> = StreamMap::new();
        for (index, child) in children.iter().enumerate() {
            events.insert(index, Box::pin(self.hub.subscribe(child).into_stream()));
        }
        for (index, child) in children.iter().enumerate() {
            if let Err(e) = queue.enqueue_job(child) {
                tracing::warn!(job_id = %parent_id, child = %child, error = %e, "Could not enqueue track");
                events.remove(&index);
                tracker.fail(index, e.to_string());
            }
        }
        drop(queue);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(JobError::Canceled),
                next = events.next() => match next {
                    Some((index, event)) => {
                        if let Some(progress) = tracker.apply(index, &event) {
                            if let Err(e) = self.store.update_progress(parent_id, progress).await {
                                tracing::warn!(job_id = %parent_id, error = %e, "Could not record multi-track progress");
                            }
                            self.hub.publish(JobEvent::progress(
                                parent_id,
                                progress,
                                Some(format!("tracks {}/{}", tracker.finished(), tracker.len())),
                            ));
                        }
                    }
                    None => break,
                },
            }
        }

        // A stream can only end early if its channel went away; trust the store.
        for index in tracker.unsettled() {
            let child = tracker.ids[index].clone();
            match self.store.get_job(&child).await {
                Ok(job) if job.status.is_terminal() => tracker.settle(index, job.status),
                Ok(job) => tracker.fail(index, format!("lost track of {child} while {}", job.status)),
                Err(e) => tracker.fail(index, format!("lost track of {child}: {e}")),
            }
        }

        let failures = tracker.failures();
        if !failures.is_empty() {
            return Err(JobError::PartialFailure {
                failed: failures.len(),
                total: tracker.len(),
                children: failures.join("; "),
            });
        }
        Ok(serde_json::json!({ "subJobIds": tracker.ids }))
    }

    /// Kill every unfinished child concurrently, then wait for all of them.
    async fn cancel_children(&self, children: &[JobId]) {
        let Ok(queue) = self.queue() else {
            return;
        };
        let mut watches = Vec::with_capacity(children.len());
        for child in children {
            let watch = self.hub.subscribe(child);
            match self.store.get_job(child).await {
                Ok(job) if job.status.is_terminal() => continue,
                Ok(_) => watches.push((child.clone(), watch)),
                Err(e) => {
                    tracing::warn!(child = %child, error = %e, "Skipping unknown track");
                }
            }
        }

        let kills = watches.iter().map(|(child, _)| {
            let queue = Arc::clone(&queue);
            async move {
                match queue.kill_job(child).await {
                    Ok(()) => true,
                    // Not active: it was never admitted or already finished.
                    Err(e) => {
                        tracing::debug!(child = %child, error = %e, "Track not active");
                        false
                    }
                }
            }
        });
        let killed = join_all(kills).await;
        tracing::info!(tracks = watches.len(), killed = killed.iter().filter(|k| **k).count(), "Canceled tracks");

        join_all(
            watches
                .iter_mut()
                .zip(killed)
                .map(|((child, watch), killed)| async move {
                    if killed || self.queue_holds(child) {
                        self.wait_terminal(child, watch).await;
                    } else if matches!(self.store.get_job(child).await, Ok(job) if !job.status.is_terminal()) {
                        // Never admitted, so no worker will record it.
                        record_canceled(&*self.store, &self.hub, child, 0.0).await;
                    }
                }),
        )
        .await;
    }

    fn queue_holds(&self, job_id: &JobId) -> bool {
        self.queue
            .upgrade()
            .is_some_and(|queue| queue.is_job_running(job_id))
    }

    async fn wait_terminal(&self, job_id: &JobId, watch: &mut Subscription) {
        if matches!(self.store.get_job(job_id).await, Ok(job) if job.status.is_terminal()) {
            return;
        }
        while let Some(event) = watch.next().await {
            if event.is_terminal() {
                return;
            }
        }
    }

    fn queue(&self) -> Result<Arc<dyn JobQueue>, JobError> {
        self.queue.upgrade().ok_or(JobError::Queue(QueueError::QueueStopped))
    }
}

/// Per-child view folded from hub events.
#[derive(Debug)]
struct ChildTracker {
    ids: Vec<JobId>,
    progress: Vec<f64>,
    status: Vec<Option<JobStatus>>,
    errors: Vec<Option<String>>,
    reported: f64,
}

impl ChildTracker {
    fn new(ids: Vec<JobId>) -> Self {
        let n = ids.len();
        Self {
            ids,
            progress: vec![0.0; n],
            status: vec![None; n],
            errors: vec![None; n],
            reported: 0.0,
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn reported(&self) -> f64 {
        self.reported
    }

    fn finished(&self) -> usize {
        self.status.iter().filter(|s| s.is_some()).count()
    }

    /// Fold one child event. Returns the new parent progress when it rose.
    fn apply(&mut self, index: usize, event: &JobEvent) -> Option<f64> {
        if self.status[index].is_some() {
            return None;
        }
        self.progress[index] = self.progress[index].max(event.progress);
        if event.is_terminal() {
            self.settle(index, event.status);
            if let Some(error) = &event.error {
                self.errors[index] = Some(error.clone());
            }
        }
        let mean = self.mean();
        if mean > self.reported {
            self.reported = mean;
            Some(mean)
        } else {
            None
        }
    }

    fn settle(&mut self, index: usize, status: JobStatus) {
        if status == JobStatus::Completed {
            self.progress[index] = 1.0;
        }
        self.status[index] = Some(status);
    }

    fn fail(&mut self, index: usize, error: String) {
        self.status[index] = Some(JobStatus::Failed);
        self.errors[index] = Some(error);
    }

    fn unsettled(&self) -> Vec<usize> {
        (0..self.len()).filter(|i| self.status[*i].is_none()).collect()
    }

    fn mean(&self) -> f64 {
        if self.progress.is_empty() {
            return 0.0;
        }
        self.progress.iter().sum::<f64>() / self.progress.len() as f64
    }

    /// One line per child that did not complete.
    fn failures(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| match self.status[i] {
                Some(JobStatus::Completed) => None,
                status => {
                    let status = status.map_or("unknown", JobStatus::as_str);
                    Some(match &self.errors[i] {
                        Some(error) => format!("{id} ({status}: {error})"),
                        None => format!("{id} ({status})"),
                    })
                }
            })
            .collect()
    }
}
