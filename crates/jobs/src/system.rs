// crates/jobs/src/system.rs
//! Wiring and lifecycle for the whole job subsystem.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::JobsConfig;
use crate::error::{ConfigError, JobError};
use crate::hub::ProgressHub;
use crate::multitrack::MultiTrackOrchestrator;
use crate::processor::{JobOutcome, JobProcessor, TranscriberCommand};
use crate::queue::{JobQueue, JobRunner, TaskQueue};
use crate::registry::ProcessRegistry;
use crate::store::JobStore;
use crate::types::JobId;

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Routes each dispatched job to the orchestrator or the processor.
pub struct Dispatcher {
    processor: JobProcessor,
    orchestrator: MultiTrackOrchestrator,
    registry: Arc<ProcessRegistry>,
}

impl Dispatcher {
    pub fn new(
        processor: JobProcessor,
        orchestrator: MultiTrackOrchestrator,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            processor,
            orchestrator,
            registry,
        }
    }
}

#[async_trait]
impl JobRunner for Dispatcher {
    async fn run(&self, job_id: &JobId, cancel: CancellationToken) -> JobOutcome {
        if self.orchestrator.is_multi_track_job(job_id).await {
            return self.orchestrator.process_job(&cancel, job_id).await;
        }
        let registry = Arc::clone(&self.registry);
        let owner = job_id.clone();
        self.processor
            .process_job_with_process(&cancel, job_id, move |handle| {
                registry.register(&owner, handle)
            })
            .await
    }
}

/// A running job subsystem: queue, workers, registry and hub.
pub struct JobSystem {
    config: JobsConfig,
    store: Arc<dyn JobStore>,
    hub: Arc<ProgressHub>,
    registry: Arc<ProcessRegistry>,
    queue: Arc<TaskQueue>,
    orchestrator: MultiTrackOrchestrator,
    janitor: JoinHandle<()>,
}

impl JobSystem {
    /// Validate `config`, build every component and spawn the workers.
    /// Must be called inside a tokio runtime.
    pub fn start(config: JobsConfig, store: Arc<dyn JobStore>) -> Result<Self, ConfigError> {
        config.validate()?;

        let hub = Arc::new(ProgressHub::new(config.event_buffer));
        let registry = Arc::new(ProcessRegistry::new(config.grace_period()));
        let command = TranscriberCommand::from(&config);

        let queue = Arc::new_cyclic(|weak: &Weak<TaskQueue>| {
            let queue_ref: Weak<dyn JobQueue> = weak.clone();
            let dispatcher = Dispatcher::new(
                JobProcessor::new(Arc::clone(&store), Arc::clone(&hub), command),
                MultiTrackOrchestrator::new(Arc::clone(&store), Arc::clone(&hub), queue_ref),
                Arc::clone(&registry),
            );
            TaskQueue::new(
                config.workers,
                Arc::new(dispatcher),
                Arc::clone(&store),
                Arc::clone(&hub),
                Arc::clone(&registry),
            )
        });
        queue.start();

        let weak = Arc::downgrade(&queue);
        let queue_ref: Weak<dyn JobQueue> = weak;
        let orchestrator = MultiTrackOrchestrator::new(Arc::clone(&store), Arc::clone(&hub), queue_ref);
        let janitor = spawn_janitor(Arc::clone(&hub));

        tracing::info!(
            workers = config.workers,
            grace_ms = config.grace_period_ms,
            executable = %config.executable.display(),
            "Job system started"
        );
        Ok(Self {
            config,
            store,
            hub,
            registry,
            queue,
            orchestrator,
            janitor,
        })
    }

    /// Stop admission, cancel pending and running jobs and wait for the workers.
    pub async fn stop(&self) {
        self.queue.stop().await;
        self.janitor.abort();
        tracing::info!("Job system stopped");
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        Arc::clone(&self.queue) as Arc<dyn JobQueue>
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub async fn is_multi_track_job(&self, job_id: &JobId) -> bool {
        self.orchestrator.is_multi_track_job(job_id).await
    }

    /// Cancel a multi-track job and its tracks, waiting until all are terminal.
    pub async fn terminate_multi_track_job(&self, job_id: &JobId) -> Result<(), JobError> {
        self.orchestrator.terminate_multi_track_job(job_id).await
    }
}

fn spawn_janitor(hub: Arc<ProgressHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(JANITOR_INTERVAL).await;
            let pruned = hub.prune_finished();
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned finished progress channels");
            }
        }
    })
}
