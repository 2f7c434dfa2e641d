//! Integration tests for the worker pull and completion endpoints.

mod common;

use axum::http::StatusCode;
use common::{body_bytes, body_json, build_test_app, post_json};
use flowgate_core::job::{FlowRunJob, FLOW_QUEUE};
use flowgate_core::types::RunId;
use flowgate_queue::QueueTransport;
use flowgate_api::ws::{RealtimeEvent, REALTIME_TOPIC};
use futures::StreamExt;
use serde_json::json;

const POLL: &str = "/api/v1/workers/poll";

// ---------------------------------------------------------------------------
// Test: polling requires a valid worker token
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_without_token_is_unauthorized() {
    let app = build_test_app().await;
    let response = post_json(&app.router, POLL, None, json!({"consumer": "w-0"})).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn poll_with_forged_token_is_unauthorized() {
    let app = build_test_app().await;
    let response = post_json(&app.router, POLL, Some("not.a.jwt"), json!({"consumer": "w-0"})).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// Test: empty queue answers 204 after the poll wait
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_on_empty_queue_returns_no_content() {
    let app = build_test_app().await;
    let token = app.worker_token();

    let response = post_json(&app.router, POLL, Some(&token), json!({"consumer": "w-0"})).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn poll_with_blank_consumer_is_bad_request() {
    let app = build_test_app().await;
    let token = app.worker_token();

    let response = post_json(&app.router, POLL, Some(&token), json!({"consumer": " "})).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Test: poll hands out a job and completion acknowledges it
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_then_complete_acknowledges_job() {
    let app = build_test_app().await;
    let token = app.worker_token();
    let job = FlowRunJob::new(RunId::from("run-1"), "flow-1", json!({"n": 1}));
    app.transport.enqueue(FLOW_QUEUE, &job).await.unwrap();

    let response = post_json(&app.router, POLL, Some(&token), json!({"consumer": "w-0"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let polled = body_json(response).await;
    assert_eq!(polled["data"]["job"]["run_id"], "run-1");
    assert_eq!(polled["data"]["job"]["payload"]["n"], 1);
    assert_eq!(app.transport.in_flight_count(), 1);

    let job_id = polled["data"]["id"].as_str().unwrap();
    let response = post_json(
        &app.router,
        &format!("/api/v1/workers/jobs/{job_id}/complete"),
        Some(&token),
        json!({"run_id": "run-1", "status": "SUCCEEDED"}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.transport.in_flight_count(), 0);
    assert_eq!(app.transport.depth(FLOW_QUEUE).await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Test: completion announces the finished run on the realtime topic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completion_publishes_run_finished_event() {
    let app = build_test_app().await;
    let token = app.worker_token();
    let mut events = app.transport.subscribe(REALTIME_TOPIC).await.unwrap();

    let response = post_json(
        &app.router,
        "/api/v1/workers/jobs/unknown-job/complete",
        Some(&token),
        json!({"run_id": "run-9", "status": "FAILED"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let payload = tokio::time::timeout(std::time::Duration::from_secs(1), events.next())
        .await
        .expect("no realtime event")
        .expect("stream ended");
    let event: RealtimeEvent = serde_json::from_slice(&payload).unwrap();
    assert_eq!(event.event, RealtimeEvent::FLOW_RUN_FINISHED);
    assert_eq!(event.data, json!({"run_id": "run-9", "status": "FAILED"}));
}
