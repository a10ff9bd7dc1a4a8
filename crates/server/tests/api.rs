//! HTTP-level tests against a live job system driving `/bin/sh` transcribers.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use audioscribe_jobs::{JobSystem, JobsConfig, MemoryJobStore};
use audioscribe_server::{create_app, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use pretty_assertions::assert_eq;
use tower::ServiceExt;

const TRANSCRIBER: &str = r#"
read -r input
case "$input" in
  *slow*)
    echo '{"stage":"transcribe","progress":0.2}'
    while true; do sleep 0.05; done ;;
  *)
    echo '{"stage":"transcribe","progress":0.5}'
    echo '{"result":{"text":"hello"}}' ;;
esac
"#;

fn test_state() -> Arc<AppState> {
    let config = JobsConfig {
        workers: 2,
        grace_period_ms: 200,
        event_buffer: 32,
        executable: "/bin/sh".into(),
        args: vec!["-c".into(), TRANSCRIBER.into()],
        stderr_tail_lines: 5,
    };
    let jobs = JobSystem::start(config, Arc::new(MemoryJobStore::new())).unwrap();
    AppState::new(Arc::new(jobs))
}

/// Helper to make a request to the app.
async fn request(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(uri);

    let body = if let Some(json) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(serde_json::to_string(&json).unwrap())
    } else {
        Body::empty()
    };

    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn wait_for_status(app: &axum::Router, id: &str, status: &str) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (code, body) = request(app.clone(), "GET", &format!("/api/jobs/{id}"), None).await;
            assert_eq!(code, StatusCode::OK);
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            if json["status"] == status {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job should reach the expected status")
}

#[tokio::test]
async fn health_check() {
    let state = test_state();
    let app = create_app(state.clone());

    let (status, body) = request(app, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"status\":\"ok\""));
    assert!(body.contains("\"workers\":2"));
    state.jobs.stop().await;
}

#[tokio::test]
async fn create_job_runs_to_completion() {
    let state = test_state();
    let app = create_app(state.clone());

    let (status, body) = request(
        app.clone(),
        "POST",
        "/api/jobs",
        Some(serde_json::json!({"id": "rec-1", "audioPath": "/audio/a.wav"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body.contains("\"id\":\"rec-1\""));

    let job = wait_for_status(&app, "rec-1", "completed").await;
    assert_eq!(job["progress"], 1.0);
    assert_eq!(job["active"], false);
    assert_eq!(job["result"]["text"], "hello");
    state.jobs.stop().await;
}

#[tokio::test]
async fn duplicate_create_and_enqueue_conflict() {
    let state = test_state();
    let app = create_app(state.clone());
    let body = serde_json::json!({"id": "rec-slow", "audioPath": "/audio/slow.wav"});

    let (status, _) = request(app.clone(), "POST", "/api/jobs", Some(body.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = request(app.clone(), "POST", "/api/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = request(app.clone(), "POST", "/api/jobs/rec-slow/enqueue", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("Job already pending or running"));

    let (status, _) = request(app.clone(), "POST", "/api/jobs/rec-slow/kill", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_status(&app, "rec-slow", "canceled").await;
    state.jobs.stop().await;
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    let state = test_state();
    let app = create_app(state.clone());

    let (status, body) = request(app.clone(), "GET", "/api/jobs/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("Job not found"));

    let (status, _) = request(app.clone(), "POST", "/api/jobs/ghost/kill", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(app.clone(), "POST", "/api/jobs/ghost/enqueue", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(app, "GET", "/api/jobs/ghost/stream", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    state.jobs.stop().await;
}

#[tokio::test]
async fn invalid_create_request_is_bad_request() {
    let state = test_state();
    let app = create_app(state.clone());

    let (status, body) = request(
        app,
        "POST",
        "/api/jobs",
        Some(serde_json::json!({"id": "no-audio"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("audioPath is required"));
    state.jobs.stop().await;
}

#[tokio::test]
async fn stats_report_pool() {
    let state = test_state();
    let app = create_app(state.clone());

    let (status, body) = request(app, "GET", "/api/jobs/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        stats,
        serde_json::json!({"waiting": 0, "active": 0, "workers": 2})
    );
    state.jobs.stop().await;
}

#[tokio::test]
async fn stream_of_finished_job_replays_final_event() {
    let state = test_state();
    let app = create_app(state.clone());

    request(
        app.clone(),
        "POST",
        "/api/jobs",
        Some(serde_json::json!({"id": "rec-done", "audioPath": "/audio/a.wav"})),
    )
    .await;
    wait_for_status(&app, "rec-done", "completed").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.jobs.queue().is_job_running(&"rec-done".into()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(5),
        request(app, "GET", "/api/jobs/rec-done/stream", None),
    )
    .await
    .expect("stream of a finished job should end");
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: result"));
    assert!(body.contains("\"text\":\"hello\""));
    state.jobs.stop().await;
}
