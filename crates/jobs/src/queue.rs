// crates/jobs/src/queue.rs
//! Task Queue: FIFO admission and a fixed pool of workers.
//!
//! Every worker owns a single-slot assignment channel. An idle worker parks
//! its sender in [`QueueState::idle`]; admission either hands the job straight
//! to a parked worker or appends it to the backlog, all under one lock, so the
//! active set, the backlog and dispatch never disagree.
//!
//! A multi-track parent holds its worker while its tracks run on the others,
//! so parents may occupy at most `workers - 1` workers at once. A parent that
//! would take the last free worker is parked in [`QueueState::deferred`] and
//! resumes when another parent finishes.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, QueueError};
use crate::hub::ProgressHub;
use crate::processor::{record_canceled, record_failure, JobOutcome};
use crate::registry::ProcessRegistry;
use crate::store::JobStore;
use crate::types::{JobId, QueueStats};

/// The capability interface over the queue, shared by the HTTP layer and the
/// multi-track orchestrator.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Admit `job_id`; never waits for a worker.
    fn enqueue_job(&self, job_id: &JobId) -> Result<(), QueueError>;

    /// Remove a waiting job, or cancel a running one. Returns once the
    /// cancellation has been issued, not once the process is gone.
    async fn kill_job(&self, job_id: &JobId) -> Result<(), QueueError>;

    /// True while the job is waiting or held by a worker.
    fn is_job_running(&self, job_id: &JobId) -> bool;

    fn queue_stats(&self) -> QueueStats;
}

/// Executes one dispatched job to a terminal state.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job_id: &JobId, cancel: CancellationToken) -> JobOutcome;
}

struct Assignment {
    job_id: JobId,
    cancel: CancellationToken,
    /// The receiving worker's own sender, parked again once it goes idle.
    worker_tx: mpsc::Sender<Assignment>,
}

enum Slot {
    Waiting,
    Running(CancellationToken),
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<JobId>,
    active: HashMap<JobId, Slot>,
    idle: Vec<mpsc::Sender<Assignment>>,
    /// Running jobs that occupy their worker while children run.
    composite: HashSet<JobId>,
    /// Multi-track parents waiting for a worker that leaves one free for tracks.
    deferred: VecDeque<JobId>,
    stopped: bool,
}

impl QueueState {
    fn running_count(&self) -> usize {
        self.active
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count()
    }

    fn waiting_count(&self) -> usize {
        self.backlog.len() + self.deferred.len()
    }
}

/// What the worker did with an assignment.
enum Executed {
    /// Ran or was recorded to a terminal state.
    Done,
    /// Parked in the deferred list; still active.
    Deferred,
}

enum Admission {
    Run,
    Deferred,
    Canceled,
    PoolTooSmall,
}

pub struct TaskQueue {
    workers: usize,
    state: Mutex<QueueState>,
    worker_tasks: Mutex<Vec<JoinHandle<()>>>,
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn JobStore>,
    hub: Arc<ProgressHub>,
    registry: Arc<ProcessRegistry>,
}

impl TaskQueue {
    /// Build a queue with `workers` slots. Nothing runs until [`start`](Self::start).
    pub fn new(
        workers: usize,
        runner: Arc<dyn JobRunner>,
        store: Arc<dyn JobStore>,
        hub: Arc<ProgressHub>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            state: Mutex::new(QueueState::default()),
            worker_tasks: Mutex::new(Vec::new()),
            runner,
            store,
            hub,
            registry,
        }
    }

    /// Spawn the worker pool. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.worker_tasks);
        if !tasks.is_empty() {
            return;
        }
        let mut state = self.lock_state();
        for index in 0..self.workers {
            let (tx, rx) = mpsc::channel(1);
            state.idle.push(tx);
            tasks.push(tokio::spawn(Arc::clone(self).worker_loop(index, rx)));
        }
        tracing::info!(workers = self.workers, "Task queue started");
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stop admission, cancel everything waiting or running, and wait for
    /// every worker to exit.
    pub async fn stop(&self) {
        let (drained, running) = {
            let mut state = self.lock_state();
            if state.stopped {
                (Vec::new(), Vec::new())
            } else {
                state.stopped = true;
                state.idle.clear();
                let mut drained: Vec<JobId> = state.backlog.drain(..).collect();
                drained.extend(state.deferred.drain(..));
                for job_id in &drained {
                    state.active.remove(job_id);
                }
                let running: Vec<JobId> = state
                    .active
                    .iter()
                    .filter_map(|(job_id, slot)| match slot {
                        Slot::Running(cancel) => {
                            cancel.cancel();
                            Some(job_id.clone())
                        }
                        Slot::Waiting => None,
                    })
                    .collect();
                (drained, running)
            }
        };
        tracing::info!(
            drained = drained.len(),
            running = running.len(),
            "Stopping task queue"
        );

        for job_id in &drained {
            record_canceled(&*self.store, &self.hub, job_id, 0.0).await;
        }
        for job_id in &running {
            drop(self.registry.terminate(job_id));
        }

        let tasks = std::mem::take(&mut *lock(&self.worker_tasks));
        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Task queue stopped");
    }

    async fn worker_loop(self: Arc<Self>, index: usize, mut rx: mpsc::Receiver<Assignment>) {
        tracing::debug!(worker = index, "Worker started");
        // Closes once the queue stops holding this worker's sender.
        while let Some(mut assignment) = rx.recv().await {
            loop {
                let executed = self.execute(index, &assignment).await;
                match self.finish(index, assignment, executed) {
                    Some(next) => assignment = next,
                    None => break,
                }
            }
        }
        tracing::debug!(worker = index, "Worker exited");
    }

    async fn execute(&self, worker: usize, assignment: &Assignment) -> Executed {
        let job_id = &assignment.job_id;
        if assignment.cancel.is_cancelled() {
            // Killed between hand-off and start.
            record_canceled(&*self.store, &self.hub, job_id, 0.0).await;
            return Executed::Done;
        }

        let composite = matches!(self.store.is_multi_track(job_id).await, Ok(true));
        if composite {
            match self.admit_composite(job_id, &assignment.cancel) {
                Admission::Run => {}
                Admission::Deferred => {
                    tracing::info!(worker, job_id = %job_id, "Multi-track job deferred until a worker is left for its tracks");
                    return Executed::Deferred;
                }
                Admission::Canceled => {
                    record_canceled(&*self.store, &self.hub, job_id, 0.0).await;
                    return Executed::Done;
                }
                Admission::PoolTooSmall => {
                    let error = JobError::InvalidInput(format!(
                        "multi-track jobs need at least 2 workers, the pool has {}",
                        self.workers
                    ));
                    record_failure(&*self.store, &self.hub, job_id, 0.0, &error).await;
                    return Executed::Done;
                }
            }
        }

        tracing::info!(worker, job_id = %job_id, composite, "Dispatching job");
        let run = AssertUnwindSafe(self.runner.run(job_id, assignment.cancel.clone()));
        match run.catch_unwind().await {
            Ok(outcome) => {
                tracing::info!(worker, job_id = %job_id, status = %outcome.status(), "Worker finished job");
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::error!(worker, job_id = %job_id, panic = %message, "Job panicked");
                let progress = self.store.get_job(job_id).await.map_or(0.0, |job| job.progress);
                record_failure(&*self.store, &self.hub, job_id, progress, &JobError::Panicked(message)).await;
            }
        }
        Executed::Done
    }

    /// Claim a composite slot for `job_id`, keeping one worker free for tracks.
    fn admit_composite(&self, job_id: &JobId, cancel: &CancellationToken) -> Admission {
        if self.workers < 2 {
            return Admission::PoolTooSmall;
        }
        let mut state = self.lock_state();
        if cancel.is_cancelled() {
            return Admission::Canceled;
        }
        if state.composite.len() + 1 >= self.workers {
            state.active.insert(job_id.clone(), Slot::Waiting);
            state.deferred.push_back(job_id.clone());
            return Admission::Deferred;
        }
        state.composite.insert(job_id.clone());
        Admission::Run
    }

    /// Release the finished job and hand the worker its next one, if any.
    /// `None` means the worker parked itself (or the queue stopped).
    fn finish(&self, worker: usize, done: Assignment, executed: Executed) -> Option<Assignment> {
        let deferred = matches!(executed, Executed::Deferred);
        if !deferred {
            self.registry.release(&done.job_id);
        }
        let mut state = self.lock_state();
        if !deferred {
            state.active.remove(&done.job_id);
            state.composite.remove(&done.job_id);
        }
        if state.stopped {
            return None;
        }
        // Deferred parents go first once a composite slot is free.
        let mut next = None;
        if state.composite.len() + 1 < self.workers {
            next = state.deferred.pop_front();
        }
        if next.is_none() {
            next = state.backlog.pop_front();
        }
        match next {
            Some(next) => {
                let cancel = CancellationToken::new();
                state
                    .active
                    .insert(next.clone(), Slot::Running(cancel.clone()));
                tracing::debug!(worker, job_id = %next, "Worker took job from backlog");
                Some(Assignment {
                    job_id: next,
                    cancel,
                    worker_tx: done.worker_tx,
                })
            }
            None => {
                state.idle.push(done.worker_tx);
                None
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Critical sections never panic halfway; recover the data.
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Task queue lock poisoned, recovering");
        poisoned.into_inner()
    })
}

#[async_trait]
impl JobQueue for TaskQueue {
    fn enqueue_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        if state.stopped {
            return Err(QueueError::QueueStopped);
        }
        if state.active.contains_key(job_id) {
            return Err(QueueError::AlreadyActive(job_id.clone()));
        }
        // Observers of this attempt must not see the previous one's end.
        self.hub.reset(job_id);

        while let Some(worker_tx) = state.idle.pop() {
            let cancel = CancellationToken::new();
            let sender = worker_tx.clone();
            let assignment = Assignment {
                job_id: job_id.clone(),
                cancel: cancel.clone(),
                worker_tx,
            };
            match sender.try_send(assignment) {
                Ok(()) => {
                    state.active.insert(job_id.clone(), Slot::Running(cancel));
                    tracing::debug!(job_id = %job_id, "Job handed to idle worker");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Idle worker unreachable, dropping it");
                }
            }
        }

        state.backlog.push_back(job_id.clone());
        state.active.insert(job_id.clone(), Slot::Waiting);
        tracing::debug!(job_id = %job_id, waiting = state.backlog.len(), "Job queued");
        Ok(())
    }

    async fn kill_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        let was_waiting = {
            let mut state = self.lock_state();
            match state.active.get(job_id) {
                None => return Err(QueueError::NotFound(job_id.clone())),
                Some(Slot::Running(cancel)) => {
                    cancel.cancel();
                    false
                }
                Some(Slot::Waiting) => {
                    state.active.remove(job_id);
                    state.backlog.retain(|queued| queued != job_id);
                    state.deferred.retain(|queued| queued != job_id);
                    true
                }
            }
        };

        if was_waiting {
            tracing::info!(job_id = %job_id, "Removed waiting job from backlog");
            record_canceled(&*self.store, &self.hub, job_id, 0.0).await;
        } else {
            tracing::info!(job_id = %job_id, "Cancellation issued to running job");
            // Escalation runs in the background; completion shows up as a status change.
            drop(self.registry.terminate(job_id));
        }
        Ok(())
    }

    fn is_job_running(&self, job_id: &JobId) -> bool {
        self.lock_state().active.contains_key(job_id)
    }

    fn queue_stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            waiting: state.waiting_count(),
            active: state.running_count(),
            workers: self.workers,
        }
    }
}
