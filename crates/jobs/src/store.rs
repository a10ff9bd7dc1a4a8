// crates/jobs/src/store.rs
//! Job Store adapter.
//!
//! The durable job record lives outside this crate; [`JobStore`] is the
//! contract the queue and processors consume. [`MemoryJobStore`] is the
//! bundled implementation used by the server binary and the tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::types::{ChildJobSpec, Job, JobId, JobKind, JobStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new job record. Fails if the ID is taken.
    async fn insert_job(&self, job: Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError>;

    /// Set `status`; `error` becomes `lastError` (cleared otherwise).
    async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn update_progress(&self, id: &JobId, progress: f64) -> Result<(), StoreError>;

    async fn set_result(&self, id: &JobId, result: serde_json::Value) -> Result<(), StoreError>;

    async fn get_result(&self, id: &JobId) -> Result<Option<serde_json::Value>, StoreError>;

    /// Create one pending child per spec and record their IDs on the parent.
    async fn create_child_jobs(
        &self,
        parent_id: &JobId,
        specs: Vec<ChildJobSpec>,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Classification query on the job's `kind`; no side effects.
    async fn is_multi_track(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self.get_job(id).await?.kind == JobKind::MultiTrack)
    }
}

struct StoredJob {
    job: Job,
    result: Option<serde_json::Value>,
}

/// In-memory [`JobStore`]. Locking is sharded per key, so workers touching
/// different jobs do not contend.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, StoredJob>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Backend(format!("job {} already exists", job.id))),
            Entry::Vacant(slot) => {
                slot.insert(StoredJob { job, result: None });
                Ok(())
            }
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        self.jobs
            .get(id)
            .map(|stored| stored.job.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut stored = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let from = stored.job.status;
        if status == JobStatus::Pending && from != JobStatus::Pending {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from,
                to: status,
            });
        }
        if status == JobStatus::Running && from != JobStatus::Running {
            // A fresh attempt starts from scratch.
            stored.job.progress = 0.0;
            stored.result = None;
        }
        stored.job.status = status;
        stored.job.last_error = error;
        stored.job.updated_at = Utc::now();
        Ok(())
    }

    async fn update_progress(&self, id: &JobId, progress: f64) -> Result<(), StoreError> {
        let mut stored = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let progress = progress.clamp(0.0, 1.0);
        if progress > stored.job.progress || stored.job.status != JobStatus::Running {
            stored.job.progress = progress;
            stored.job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_result(&self, id: &JobId, result: serde_json::Value) -> Result<(), StoreError> {
        let mut stored = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        stored.result = Some(result);
        stored.job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_result(&self, id: &JobId) -> Result<Option<serde_json::Value>, StoreError> {
        self.jobs
            .get(id)
            .map(|stored| stored.result.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn create_child_jobs(
        &self,
        parent_id: &JobId,
        specs: Vec<ChildJobSpec>,
    ) -> Result<Vec<JobId>, StoreError> {
        if !self.jobs.contains_key(parent_id) {
            return Err(StoreError::NotFound(parent_id.clone()));
        }

        // Fresh IDs per attempt so a re-run never observes an older child's state.
        let attempt = ulid::Ulid::new().to_string().to_lowercase();
        let mut child_ids = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let child_id = JobId::new(format!("{parent_id}.track{}.{attempt}", index + 1));
            let mut child = Job::single(child_id.clone(), spec.input);
            child.parent_id = Some(parent_id.clone());
            self.jobs.insert(
                child_id.clone(),
                StoredJob {
                    job: child,
                    result: None,
                },
            );
            child_ids.push(child_id);
        }

        let mut parent = self
            .jobs
            .get_mut(parent_id)
            .ok_or_else(|| StoreError::NotFound(parent_id.clone()))?;
        parent.job.sub_job_ids = child_ids.clone();
        parent.job.updated_at = Utc::now();
        Ok(child_ids)
    }
}
