// crates/jobs/src/hub.rs
//! Progress Stream Hub: per-job publish/subscribe of [`JobEvent`]s.
//!
//! Each job gets its own `broadcast` channel, so every subscriber owns an
//! independent bounded view of the stream. A subscriber that falls behind
//! loses its oldest events and resumes at the oldest one still buffered;
//! publishing never waits on anyone.

use async_stream::stream;
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::Stream;

use crate::types::{JobEvent, JobId};

const GLOBAL_CAPACITY: usize = 256;

struct Channel {
    tx: broadcast::Sender<JobEvent>,
    /// Most recent event, replayed to new subscribers.
    last: Option<JobEvent>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
            last: None,
        }
    }
}

pub struct ProgressHub {
    capacity: usize,
    channels: DashMap<JobId, Channel>,
    global_tx: broadcast::Sender<JobEvent>,
}

impl ProgressHub {
    /// `capacity` is the per-subscriber buffer, in events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: DashMap::new(),
            global_tx: broadcast::channel(GLOBAL_CAPACITY).0,
        }
    }

    /// Deliver `event` to every current subscriber of its job. Never blocks or fails.
    pub fn publish(&self, event: JobEvent) {
        tracing::trace!(job_id = %event.job_id, kind = event.kind.as_str(), progress = event.progress, "publish");
        {
            let mut channel = self
                .channels
                .entry(event.job_id.clone())
                .or_insert_with(|| Channel::new(self.capacity));
            channel.last = Some(event.clone());
            // Err only means nobody is listening.
            let _ = channel.tx.send(event.clone());
        }
        let _ = self.global_tx.send(event);
    }

    /// Observe one job. The current state (if any) is delivered first.
    pub fn subscribe(&self, job_id: &JobId) -> Subscription {
        let channel = self
            .channels
            .entry(job_id.clone())
            .or_insert_with(|| Channel::new(self.capacity));
        Subscription {
            job_id: job_id.clone(),
            replay: channel.last.clone(),
            rx: channel.tx.subscribe(),
            done: false,
        }
    }

    /// Observe every job's events (no replay, no terminal cut-off).
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.global_tx.subscribe()
    }

    /// Forget the replay slot so observers of a new attempt start clean.
    pub fn reset(&self, job_id: &JobId) {
        if let Some(mut channel) = self.channels.get_mut(job_id) {
            channel.last = None;
        }
    }

    pub fn last_event(&self, job_id: &JobId) -> Option<JobEvent> {
        self.channels.get(job_id).and_then(|c| c.last.clone())
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.channels
            .get(job_id)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Jobs with a live channel, watched or not.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop unwatched channels of finished jobs and of jobs that never
    /// published anything. Returns how many went.
    pub fn prune_finished(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, channel| {
            let idle = channel.last.as_ref().map_or(true, JobEvent::is_terminal);
            !(idle && channel.tx.receiver_count() == 0)
        });
        before.saturating_sub(self.channels.len())
    }
}

/// A live, revocable registration for one job's events. Dropping it unsubscribes.
pub struct Subscription {
    job_id: JobId,
    replay: Option<JobEvent>,
    rx: broadcast::Receiver<JobEvent>,
    done: bool,
}

impl Subscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next event, or `None` once a terminal event has been delivered.
    pub async fn next(&mut self) -> Option<JobEvent> {
        if self.done {
            return None;
        }
        if let Some(event) = self.replay.take() {
            self.done = event.is_terminal();
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    self.done = event.is_terminal();
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %self.job_id, skipped, "Subscriber lagging, dropped oldest events");
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send {
        let mut sub = self;
        stream! {
            while let Some(event) = sub.next().await {
                yield event;
            }
        }
    }
}
