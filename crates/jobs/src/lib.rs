//! Job queue and process supervision for audio transcription.
//!
//! A [`TaskQueue`] admits job IDs and hands them to a fixed pool of workers.
//! Each worker runs a [`JobProcessor`] (one transcriber process) or a
//! [`MultiTrackOrchestrator`] (one child job per track). Spawned processes are
//! tracked by the [`ProcessRegistry`] so a kill can reach them, and progress
//! flows to observers through the [`ProgressHub`]. [`JobSystem`] wires all of
//! it together.

pub mod config;
pub mod error;
pub mod hub;
pub mod multitrack;
pub mod processor;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod store;
pub mod system;
pub mod types;

pub use config::JobsConfig;
pub use error::{ConfigError, JobError, QueueError, StoreError};
pub use hub::{ProgressHub, Subscription};
pub use multitrack::MultiTrackOrchestrator;
pub use processor::{JobOutcome, JobProcessor, TranscriberCommand};
pub use queue::{JobQueue, JobRunner, TaskQueue};
pub use registry::{begin_shutdown, ChildProcess, ProcessHandle, ProcessRegistry, ShutdownOutcome};
pub use store::{JobStore, MemoryJobStore};
pub use system::{Dispatcher, JobSystem};
pub use types::{
    ChildJobSpec, EventKind, Job, JobEvent, JobId, JobInput, JobKind, JobStatus, QueueStats,
    TrackInput,
};
