// crates/jobs/src/registry.rs
//! Process Registry: OS-level handles of transcriber processes, per job.
//!
//! A worker registers each process it spawns; `KillJob` terminates them.
//! Termination is SIGTERM, then SIGKILL for anything still alive once the
//! grace period elapses. A process that already exited counts as terminated.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::JobError;
use crate::types::JobId;

/// Opaque handle to a spawned process.
#[async_trait]
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    fn has_exited(&self) -> bool;

    /// Graceful termination request (SIGTERM). No-op once exited.
    fn terminate(&self) -> Result<(), JobError>;

    /// Forceful kill (SIGKILL). No-op once exited.
    fn kill(&self) -> Result<(), JobError>;

    /// Resolves once the process has exited.
    async fn exited(&self);
}

/// Handle for a `tokio::process::Child` whose owner keeps the `Child` itself
/// for reading and reaping.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
}

/// Held by the owner of the `Child`; flips the handle to exited once reaped.
#[derive(Debug)]
pub struct ExitNotifier(watch::Sender<bool>);

impl ExitNotifier {
    pub fn mark_exited(&self) {
        self.0.send_replace(true);
    }
}

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        // An owner that goes away has either reaped the child or dropped it
        // (kill_on_drop), so the pid must not be signalled any more.
        self.0.send_replace(true);
    }
}

impl ChildProcess {
    pub fn new(pid: Option<u32>) -> (Self, ExitNotifier) {
        let (tx, rx) = watch::channel(pid.is_none());
        (Self { pid, exited: rx }, ExitNotifier(tx))
    }

    fn signal(&self, signal: Signal) -> Result<(), JobError> {
        match self.pid {
            Some(pid) if !self.has_exited() => send_signal(pid, signal),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn terminate(&self) -> Result<(), JobError> {
        self.signal(Signal::Term)
    }

    fn kill(&self) -> Result<(), JobError> {
        self.signal(Signal::Kill)
    }

    async fn exited(&self) {
        let mut rx = self.exited.clone();
        // Err means the notifier is gone, which also means exited.
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<(), JobError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| JobError::Signal {
        pid,
        message: "pid out of range".into(),
    })?;
    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match kill(Pid::from_raw(raw), sig) {
        // ESRCH: exited on its own between the check and the signal.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(JobError::Signal {
            pid,
            message: errno.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) -> Result<(), JobError> {
    Err(JobError::Signal {
        pid,
        message: "process signals are only supported on unix".into(),
    })
}

/// How a termination request ended for one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    AlreadyExited,
    /// Exited within the grace period.
    Terminated,
    /// Still alive after the grace period; SIGKILL sent.
    Killed,
    Failed(String),
}

/// Send SIGTERM now and escalate to SIGKILL in the background after `grace`.
pub fn begin_shutdown(
    handle: Arc<dyn ProcessHandle>,
    grace: Duration,
) -> JoinHandle<ShutdownOutcome> {
    if handle.has_exited() {
        return tokio::spawn(async { ShutdownOutcome::AlreadyExited });
    }
    if let Err(e) = handle.terminate() {
        tracing::warn!(pid = ?handle.pid(), error = %e, "SIGTERM failed; will escalate");
    }
    tokio::spawn(async move {
        if tokio::time::timeout(grace, handle.exited()).await.is_ok() {
            return ShutdownOutcome::Terminated;
        }
        tracing::warn!(
            pid = ?handle.pid(),
            grace_ms = grace.as_millis() as u64,
            "Process ignored SIGTERM, sending SIGKILL"
        );
        match handle.kill() {
            Ok(()) => ShutdownOutcome::Killed,
            Err(e) => {
                tracing::error!(pid = ?handle.pid(), error = %e, "SIGKILL failed");
                ShutdownOutcome::Failed(e.to_string())
            }
        }
    })
}

/// Pending escalation tasks of one `terminate` call.
#[derive(Debug, Default)]
pub struct Termination {
    tasks: Vec<JoinHandle<ShutdownOutcome>>,
}

impl Termination {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every handle to exit or be killed.
    pub async fn wait(self) -> Vec<ShutdownOutcome> {
        futures_util::future::join_all(self.tasks)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) => ShutdownOutcome::Failed(e.to_string()),
            })
            .collect()
    }
}

#[derive(Default)]
struct JobProcesses {
    handles: Vec<Arc<dyn ProcessHandle>>,
    terminating: bool,
}

/// Per-job process handles. Access is sharded per job ID.
pub struct ProcessRegistry {
    grace: Duration,
    jobs: DashMap<JobId, JobProcesses>,
}

impl ProcessRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            jobs: DashMap::new(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Associate a handle with a job. A handle registered while the job is
    /// being terminated is shut down immediately.
    pub fn register(&self, job_id: &JobId, handle: Arc<dyn ProcessHandle>) {
        let terminating = {
            let mut entry = self.jobs.entry(job_id.clone()).or_default();
            entry.handles.push(Arc::clone(&handle));
            entry.terminating
        };
        tracing::debug!(job_id = %job_id, pid = ?handle.pid(), terminating, "Registered process");
        if terminating {
            drop(begin_shutdown(handle, self.grace));
        }
    }

    /// SIGTERM every live handle of the job now; SIGKILL stragglers after the
    /// grace period. Idempotent.
    pub fn terminate(&self, job_id: &JobId) -> Termination {
        let handles = match self.jobs.get_mut(job_id) {
            Some(mut entry) => {
                entry.terminating = true;
                entry.handles.clone()
            }
            None => return Termination::default(),
        };
        tracing::info!(job_id = %job_id, processes = handles.len(), "Terminating job processes");
        Termination {
            tasks: handles
                .into_iter()
                .map(|handle| begin_shutdown(handle, self.grace))
                .collect(),
        }
    }

    /// Drop every handle of a job that reached a terminal status.
    pub fn release(&self, job_id: &JobId) {
        self.jobs.remove(job_id);
    }

    pub fn process_count(&self, job_id: &JobId) -> usize {
        self.jobs.get(job_id).map(|e| e.handles.len()).unwrap_or(0)
    }

    pub fn tracked_jobs(&self) -> Vec<JobId> {
        self.jobs.iter().map(|e| e.key().clone()).collect()
    }
}
