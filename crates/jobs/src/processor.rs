// crates/jobs/src/processor.rs
//! Job Processor: runs one transcription as an external process.
//!
//! Spawns the configured transcriber, writes the job's input descriptor to its
//! stdin, and turns the stdout line protocol into store updates and hub events.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::JobsConfig;
use crate::error::JobError;
use crate::hub::ProgressHub;
use crate::protocol::{ExitInfo, ProgressUpdate, ProtocolState};
use crate::registry::{begin_shutdown, ChildProcess, ProcessHandle};
use crate::store::JobStore;
use crate::types::{JobEvent, JobId, JobInput, JobStatus};

/// Terminal outcome of one job, as recorded in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Canceled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
            Self::Canceled => JobStatus::Canceled,
        }
    }
}

/// How to launch the transcriber.
#[derive(Debug, Clone)]
pub struct TranscriberCommand {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub grace_period: Duration,
    pub stderr_tail_lines: usize,
}

impl TranscriberCommand {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            grace_period: Duration::from_secs(5),
            stderr_tail_lines: 20,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

impl From<&JobsConfig> for TranscriberCommand {
    fn from(config: &JobsConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            grace_period: config.grace_period(),
            stderr_tail_lines: config.stderr_tail_lines,
        }
    }
}

pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    hub: Arc<ProgressHub>,
    command: TranscriberCommand,
}

impl JobProcessor {
    pub fn new(store: Arc<dyn JobStore>, hub: Arc<ProgressHub>, command: TranscriberCommand) -> Self {
        Self {
            store,
            hub,
            command,
        }
    }

    /// Run the job to a terminal state. Cancellation through `cancel` is
    /// honoured, but nobody else can reach the spawned process.
    pub async fn process_job(&self, cancel: &CancellationToken, job_id: &JobId) -> JobOutcome {
        self.process_job_with_process(cancel, job_id, |_| {}).await
    }

    /// Same as [`process_job`](Self::process_job), but hands the spawned
    /// process to `register_process` right after spawn so it can be
    /// terminated from outside before it completes.
    pub async fn process_job_with_process<F>(
        &self,
        cancel: &CancellationToken,
        job_id: &JobId,
        register_process: F,
    ) -> JobOutcome
    where
        F: FnOnce(Arc<dyn ProcessHandle>) + Send,
    {
        let started = Instant::now();
        let mut progress = 0.0;
        let result = self
            .run(cancel, job_id, register_process, &mut progress)
            .await;
        let outcome = self.record(job_id, result, progress).await;
        tracing::info!(
            job_id = %job_id,
            status = %outcome.status(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transcription finished"
        );
        outcome
    }

    async fn run<F>(
        &self,
        cancel: &CancellationToken,
        job_id: &JobId,
        register_process: F,
        progress: &mut f64,
    ) -> Result<serde_json::Value, JobError>
    where
        F: FnOnce(Arc<dyn ProcessHandle>) + Send,
    {
        if cancel.is_cancelled() {
            return Err(JobError::Canceled);
        }
        let job = self.store.get_job(job_id).await?;
        self.store
            .update_status(job_id, JobStatus::Running, None)
            .await?;
        self.hub
            .publish(JobEvent::status(job_id, JobStatus::Running, 0.0));

        let program = self.command.executable.display().to_string();
        tracing::info!(job_id = %job_id, program = %program, "Spawning transcriber");

        let mut child = Command::new(&self.command.executable)
            .args(&self.command.args)
            .env("AUDIOSCRIBE_JOB_ID", job_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Early returns below drop the child; never leave it running.
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                tracing::error!(job_id = %job_id, program = %program, error = %source, "Failed to spawn transcriber");
                JobError::ProcessSpawn {
                    program: program.clone(),
                    source,
                }
            })?;

        let (handle, exit_notifier) = ChildProcess::new(child.id());
        let handle: Arc<dyn ProcessHandle> = Arc::new(handle);
        register_process(Arc::clone(&handle));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::exit(None, "failed to capture transcriber stdout"))?;
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_input(job_id.clone(), stdin, job.input.clone()));
        }
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_tail(job_id.clone(), stderr, self.command.stderr_tail_lines)));

        let mut protocol = ProtocolState::new();
        let mut lines = BufReader::new(stdout).lines();
        let mut shutdown = None;
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(update) = protocol.feed(&line) {
                            *progress = update.progress;
                            self.report_progress(job_id, update).await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Error reading transcriber stdout");
                        break;
                    }
                },
                _ = cancel.cancelled(), if shutdown.is_none() => {
                    tracing::info!(job_id = %job_id, pid = ?handle.pid(), "Cancellation requested, stopping transcriber");
                    shutdown = Some(begin_shutdown(Arc::clone(&handle), self.command.grace_period));
                }
            }
        }

        let status = child.wait().await?;
        exit_notifier.mark_exited();
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        tracing::debug!(job_id = %job_id, exit_code = ?status.code(), parsed_lines = protocol.parsed_lines(), "Transcriber exited");

        // A kill wins over whatever the process did on its way out.
        if cancel.is_cancelled() {
            return Err(JobError::Canceled);
        }
        protocol.finish(ExitInfo::from(status), &stderr_tail)
    }

    async fn report_progress(&self, job_id: &JobId, update: ProgressUpdate) -> Result<(), JobError> {
        self.store.update_progress(job_id, update.progress).await?;
        self.hub
            .publish(JobEvent::progress(job_id, update.progress, update.stage));
        Ok(())
    }

    async fn record(
        &self,
        job_id: &JobId,
        result: Result<serde_json::Value, JobError>,
        progress: f64,
    ) -> JobOutcome {
        match result {
            Ok(value) => record_completed(&*self.store, &self.hub, job_id, value, progress).await,
            Err(JobError::Canceled) => record_canceled(&*self.store, &self.hub, job_id, progress).await,
            Err(e) => record_failure(&*self.store, &self.hub, job_id, progress, &e).await,
        }
    }
}

/// Store the result and mark the job completed. Falls back to recording a
/// failure if the store rejects the result.
pub(crate) async fn record_completed(
    store: &dyn JobStore,
    hub: &ProgressHub,
    job_id: &JobId,
    value: serde_json::Value,
    progress: f64,
) -> JobOutcome {
    let stored = async {
        store.set_result(job_id, value.clone()).await?;
        store.update_progress(job_id, 1.0).await?;
        store.update_status(job_id, JobStatus::Completed, None).await
    };
    match stored.await {
        Ok(()) => {
            hub.publish(JobEvent::result(job_id, value));
            JobOutcome::Completed
        }
        Err(e) => record_failure(store, hub, job_id, progress, &JobError::Store(e)).await,
    }
}

/// Mark a job failed. Store errors are logged, never propagated.
pub(crate) async fn record_failure(
    store: &dyn JobStore,
    hub: &ProgressHub,
    job_id: &JobId,
    progress: f64,
    error: &JobError,
) -> JobOutcome {
    let message = error.to_string();
    tracing::warn!(job_id = %job_id, error = %message, "Job failed");
    if let Err(e) = store
        .update_status(job_id, JobStatus::Failed, Some(message.clone()))
        .await
    {
        tracing::error!(job_id = %job_id, error = %e, "Could not record job failure");
    }
    hub.publish(JobEvent::error(job_id, progress, message.clone()));
    JobOutcome::Failed(message)
}

/// Mark a job canceled. Store errors are logged, never propagated.
pub(crate) async fn record_canceled(
    store: &dyn JobStore,
    hub: &ProgressHub,
    job_id: &JobId,
    progress: f64,
) -> JobOutcome {
    tracing::info!(job_id = %job_id, "Job canceled");
    if let Err(e) = store
        .update_status(job_id, JobStatus::Canceled, None)
        .await
    {
        tracing::error!(job_id = %job_id, error = %e, "Could not record job cancellation");
    }
    hub.publish(JobEvent::canceled(job_id, progress));
    JobOutcome::Canceled
}

async fn write_input(job_id: JobId, mut stdin: tokio::process::ChildStdin, input: JobInput) {
    let payload = match serde_json::to_vec(&input) {
        Ok(mut bytes) => {
            bytes.push(b'\n');
            bytes
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to serialize job input");
            return;
        }
    };
    // A transcriber that exits without reading stdin gives EPIPE; its exit
    // status tells the real story.
    if let Err(e) = stdin.write_all(&payload).await {
        tracing::debug!(job_id = %job_id, error = %e, "Could not write job input");
    }
}

async fn collect_tail<R>(job_id: JobId, stderr: R, keep: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(keep);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(job_id = %job_id, line = %line, "transcriber stderr");
        if keep == 0 {
            continue;
        }
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}
