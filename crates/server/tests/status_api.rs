//! Status endpoints exercised through the router, without binding a socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tower::ServiceExt;

use episodic_scheduler::{GpuLockOptions, Scheduler, StatusSnapshot, WorkerOptions};
use episodic_server::{build_router, AppState};

fn scheduler() -> Scheduler {
    Scheduler::with_options(
        GpuLockOptions::in_process(Duration::from_secs(900)),
        WorkerOptions::default(),
        10,
    )
    .unwrap()
}

async fn get_json(scheduler: &Scheduler, uri: &str) -> (StatusCode, Value) {
    let app = build_router(Arc::new(AppState::new(scheduler.status())), "*");
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn health_reports_ok() {
    let scheduler = scheduler();
    let (status, body) = get_json(&scheduler, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["drained"], true);
}

#[tokio::test]
async fn empty_queue_status() {
    let scheduler = scheduler();
    let (status, body) = get_json(&scheduler, "/queue/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["group_queues"], serde_json::json!({}));
    assert_eq!(body["lock"]["held"], false);
}

#[tokio::test]
async fn busy_queue_status_and_lock() {
    let scheduler = scheduler();
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let head = scheduler
        .enqueue("default", "episode-1", move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        })
        .unwrap();
    let tail = scheduler.enqueue("default", "episode-2", || async { Ok(()) }).unwrap();
    started_rx.await.unwrap();

    let (_, body) = get_json(&scheduler, "/queue/status").await;
    let group = &body["group_queues"]["default"];
    assert_eq!(group["size"], 1);
    assert_eq!(group["worker_active"], true);
    assert_eq!(group["currently_processing_name"], "episode-1");

    // The payload must parse back for remote gatekeepers.
    let parsed: StatusSnapshot = serde_json::from_value(body).unwrap();
    assert!(!parsed.is_drained());

    let (_, lock) = get_json(&scheduler, "/lock/status").await;
    assert_eq!(lock["held"], true);
    assert_eq!(lock["holderId"], format!("default/episode-1#{}", head.task_id));
    assert!(lock["heldSinceSeconds"].as_f64().unwrap() >= 0.0);

    let (status, group) = get_json(&scheduler, "/queue/status/default").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(group["items"], serde_json::json!(["episode-2"]));

    release_tx.send(()).unwrap();
    head.wait().await.unwrap();
    tail.wait().await.unwrap();
    scheduler.shutdown().await;
}

#[tokio::test]
async fn unknown_group_is_404() {
    let scheduler = scheduler();
    let (status, body) = get_json(&scheduler, "/queue/status/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}
