//! End-to-end tests: real `/bin/sh` transcribers driven through the queue.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use audioscribe_jobs::{
    EventKind, Job, JobEvent, JobId, JobInput, JobStatus, JobStore, JobSystem, JobsConfig,
    MemoryJobStore, QueueError, QueueStats, Subscription, TrackInput,
};
use pretty_assertions::assert_eq;

/// Behaviour is picked from the audio path in the input descriptor.
const TRANSCRIBER: &str = r#"
read -r input
case "$input" in
  *fail*)
    echo '{"stage":"transcribe","progress":0.5}'
    echo '{"error":"decoder crashed"}'
    exit 2 ;;
  *stubborn*)
    trap '' TERM
    echo '{"stage":"transcribe","progress":0.1}'
    while true; do sleep 0.05; done ;;
  *slow*)
    trap 'exit 9' TERM
    echo '{"stage":"transcribe","progress":0.1}'
    while true; do sleep 0.05; done ;;
  *noisy*)
    printf '%0199d\342\226\210 progress bar\n' 0
    echo '{"result":{"text":"noisy"}}' ;;
  *)
    echo '{"stage":"load","progress":0.3}'
    echo 'not protocol output'
    echo '{"stage":"transcribe","progress":0.9}'
    printf '{"result":{"text":"ok","input":%s}}\n' "$input" ;;
esac
"#;

const DEADLINE: Duration = Duration::from_secs(15);

fn config(workers: usize) -> JobsConfig {
    JobsConfig {
        workers,
        grace_period_ms: 300,
        event_buffer: 64,
        executable: "/bin/sh".into(),
        args: vec!["-c".into(), TRANSCRIBER.into()],
        stderr_tail_lines: 5,
    }
}

fn start(workers: usize) -> (JobSystem, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    let system = JobSystem::start(config(workers), store.clone()).unwrap();
    (system, store)
}

async fn submit(store: &MemoryJobStore, id: &str, path: &str) -> JobId {
    store
        .insert_job(Job::single(id, JobInput::new(path)))
        .await
        .unwrap();
    JobId::new(id)
}

async fn submit_tracks(store: &MemoryJobStore, id: &str, paths: &[&str]) -> JobId {
    let mut input = JobInput::new("/rec");
    input.tracks = paths
        .iter()
        .enumerate()
        .map(|(i, path)| TrackInput {
            label: format!("speaker-{}", i + 1),
            audio_path: (*path).into(),
        })
        .collect();
    input.params = serde_json::json!({"language": "en"});
    store.insert_job(Job::multi_track(id, input)).await.unwrap();
    JobId::new(id)
}

/// Drain a subscription through its terminal event.
async fn drain(mut sub: Subscription) -> Vec<JobEvent> {
    tokio::time::timeout(DEADLINE, async {
        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("job should reach a terminal state")
}

/// Wait for the first progress event, i.e. the transcriber is running.
async fn wait_started(sub: &mut Subscription) {
    tokio::time::timeout(DEADLINE, async {
        while let Some(event) = sub.next().await {
            if event.kind == EventKind::Progress {
                return;
            }
        }
        panic!("stream ended before the job started");
    })
    .await
    .expect("job should start");
}

fn assert_non_decreasing(events: &[JobEvent]) {
    assert!(
        events.windows(2).all(|w| w[0].progress <= w[1].progress),
        "progress went backwards: {:?}",
        events.iter().map(|e| e.progress).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn single_job_completes_with_result() {
    let (system, store) = start(2);
    let id = submit(&store, "rec-1", "/audio/interview.wav").await;
    let sub = system.hub().subscribe(&id);

    system.queue().enqueue_job(&id).unwrap();
    let events = drain(sub).await;

    assert_non_decreasing(&events);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Result);
    assert_eq!(last.status, JobStatus::Completed);

    let job = store.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.last_error, None);
    let result = store.get_result(&id).await.unwrap().unwrap();
    assert_eq!(result["text"], "ok");
    assert_eq!(result["input"]["audioPath"], "/audio/interview.wav");
    system.stop().await;
}

#[tokio::test]
async fn long_non_protocol_output_is_skipped_with_debug_logging() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();
    let _logging = tracing::subscriber::set_default(subscriber);

    let (system, store) = start(2);
    let id = submit(&store, "rec-noisy", "/audio/noisy.wav").await;
    let sub = system.hub().subscribe(&id);
    system.queue().enqueue_job(&id).unwrap();
    drain(sub).await;

    assert_eq!(store.get_job(&id).await.unwrap().status, JobStatus::Completed);
    assert_eq!(
        store.get_result(&id).await.unwrap(),
        Some(serde_json::json!({"text": "noisy"}))
    );
    system.stop().await;
}

#[tokio::test]
async fn failing_transcriber_records_error() {
    let (system, store) = start(2);
    let id = submit(&store, "rec-bad", "/audio/fail.wav").await;
    let sub = system.hub().subscribe(&id);

    system.queue().enqueue_job(&id).unwrap();
    let events = drain(sub).await;

    assert_eq!(events.last().unwrap().kind, EventKind::Error);
    let job = store.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("decoder crashed"));
    system.stop().await;
}

#[tokio::test]
async fn duplicate_enqueue_rejected_until_terminal() {
    let (system, store) = start(2);
    let queue = system.queue();
    let id = submit(&store, "rec-dup", "/audio/a.wav").await;

    let sub = system.hub().subscribe(&id);
    queue.enqueue_job(&id).unwrap();
    assert_eq!(
        queue.enqueue_job(&id),
        Err(QueueError::AlreadyActive(id.clone()))
    );
    drain(sub).await;
    tokio::time::timeout(DEADLINE, async {
        while queue.is_job_running(&id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Re-admission clears the previous attempt's terminal event from the hub.
    queue.enqueue_job(&id).unwrap();
    let sub = system.hub().subscribe(&id);
    let events = drain(sub).await;
    assert_eq!(events.last().unwrap().status, JobStatus::Completed);
    assert_eq!(store.get_job(&id).await.unwrap().status, JobStatus::Completed);
    system.stop().await;
}

#[tokio::test]
async fn kill_running_job_is_canceled_not_failed() {
    let (system, store) = start(2);
    let id = submit(&store, "rec-slow", "/audio/slow.wav").await;
    let mut sub = system.hub().subscribe(&id);

    system.queue().enqueue_job(&id).unwrap();
    wait_started(&mut sub).await;
    assert_eq!(system.registry().process_count(&id), 1);

    // The script exits 9 on SIGTERM; the kill still wins.
    system.queue().kill_job(&id).await.unwrap();
    let events = drain(sub).await;

    assert_eq!(events.last().unwrap().status, JobStatus::Canceled);
    let job = store.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(job.last_error, None);
    system.stop().await;
}

#[tokio::test]
async fn process_ignoring_sigterm_is_killed_after_grace() {
    let (system, store) = start(2);
    let id = submit(&store, "rec-stubborn", "/audio/stubborn.wav").await;
    let mut sub = system.hub().subscribe(&id);

    system.queue().enqueue_job(&id).unwrap();
    wait_started(&mut sub).await;
    system.queue().kill_job(&id).await.unwrap();
    drain(sub).await;

    assert_eq!(store.get_job(&id).await.unwrap().status, JobStatus::Canceled);
    system.stop().await;
}

#[tokio::test]
async fn stats_exact_immediately_after_enqueue() {
    let (system, store) = start(2);
    let queue = system.queue();
    let mut ids = Vec::new();
    for n in 1..=5 {
        ids.push(submit(&store, &format!("rec-{n}"), &format!("/audio/slow-{n}.wav")).await);
    }
    for id in &ids {
        queue.enqueue_job(id).unwrap();
    }
    assert_eq!(
        queue.queue_stats(),
        QueueStats {
            waiting: 3,
            active: 2,
            workers: 2
        }
    );

    tokio::time::timeout(DEADLINE, system.stop())
        .await
        .expect("stop should finish");
    for id in &ids {
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Canceled);
    }
    assert_eq!(
        queue.enqueue_job(&ids[0]),
        Err(QueueError::QueueStopped)
    );
}

#[tokio::test]
async fn multi_track_partial_failure_keeps_completed_results() {
    let (system, store) = start(4);
    let parent = submit_tracks(
        &store,
        "rec-panel",
        &["/rec/host.wav", "/rec/fail.wav", "/rec/guest.wav"],
    )
    .await;
    let sub = system.hub().subscribe(&parent);

    system.queue().enqueue_job(&parent).unwrap();
    let events = drain(sub).await;
    assert_non_decreasing(&events);

    let job = store.get_job(&parent).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("1 of 3 tracks"));
    assert_eq!(job.sub_job_ids.len(), 3);

    let children = &job.sub_job_ids;
    assert_eq!(store.get_job(&children[1]).await.unwrap().status, JobStatus::Failed);
    for child in [&children[0], &children[2]] {
        assert_eq!(store.get_job(child).await.unwrap().status, JobStatus::Completed);
        let result = store.get_result(child).await.unwrap().unwrap();
        assert_eq!(result["input"]["params"]["language"], "en");
    }
    system.stop().await;
}

#[tokio::test]
async fn multi_track_success_aggregates_children() {
    let (system, store) = start(3);
    let parent = submit_tracks(&store, "rec-duo", &["/rec/a.wav", "/rec/b.wav"]).await;
    let sub = system.hub().subscribe(&parent);

    system.queue().enqueue_job(&parent).unwrap();
    let events = drain(sub).await;
    assert_non_decreasing(&events);
    assert_eq!(events.last().unwrap().progress, 1.0);

    let job = store.get_job(&parent).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let result = store.get_result(&parent).await.unwrap().unwrap();
    assert_eq!(result, serde_json::json!({ "subJobIds": job.sub_job_ids }));
    for child in &job.sub_job_ids {
        let child_job = store.get_job(child).await.unwrap();
        assert_eq!(child_job.parent_id.as_ref(), Some(&parent));
        assert_eq!(child_job.status, JobStatus::Completed);
    }
    system.stop().await;
}

#[tokio::test]
async fn killing_multi_track_parent_cancels_children() {
    let (system, store) = start(3);
    let parent = submit_tracks(&store, "rec-long", &["/rec/slow-a.wav", "/rec/slow-b.wav"]).await;
    let mut sub = system.hub().subscribe(&parent);

    system.queue().enqueue_job(&parent).unwrap();
    wait_started(&mut sub).await;
    system.queue().kill_job(&parent).await.unwrap();
    let events = drain(sub).await;

    assert_eq!(events.last().unwrap().status, JobStatus::Canceled);
    let job = store.get_job(&parent).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    for child in &job.sub_job_ids {
        assert_eq!(store.get_job(child).await.unwrap().status, JobStatus::Canceled);
    }
    system.stop().await;
}

#[tokio::test]
async fn terminate_multi_track_job_waits_for_children() {
    let (system, store) = start(3);
    let parent = submit_tracks(&store, "rec-term", &["/rec/slow-a.wav", "/rec/slow-b.wav"]).await;
    let mut sub = system.hub().subscribe(&parent);

    system.queue().enqueue_job(&parent).unwrap();
    wait_started(&mut sub).await;
    assert!(system.is_multi_track_job(&parent).await);

    tokio::time::timeout(DEADLINE, system.terminate_multi_track_job(&parent))
        .await
        .expect("termination should finish")
        .unwrap();

    let job = store.get_job(&parent).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    for child in &job.sub_job_ids {
        assert!(store.get_job(child).await.unwrap().status.is_terminal());
    }
    system.stop().await;
}

#[tokio::test]
async fn two_multi_track_parents_on_two_workers_both_finish() {
    let (system, store) = start(2);
    let first = submit_tracks(&store, "rec-p1", &["/rec/p1-host.wav"]).await;
    let second = submit_tracks(&store, "rec-p2", &["/rec/p2-host.wav"]).await;
    let first_sub = system.hub().subscribe(&first);
    let second_sub = system.hub().subscribe(&second);

    let queue = system.queue();
    queue.enqueue_job(&first).unwrap();
    queue.enqueue_job(&second).unwrap();
    drain(first_sub).await;
    drain(second_sub).await;

    for parent in [&first, &second] {
        let job = store.get_job(parent).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "{parent}");
        assert_eq!(job.sub_job_ids.len(), 1);
    }
    system.stop().await;
}
