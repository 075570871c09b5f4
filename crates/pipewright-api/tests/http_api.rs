//! REST API over a real data directory: config, graph files and SQLite.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use pipewright_api::http::router::build_router;
use pipewright_api::state::AppState;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

const CONFIG: &str = r#"
[defaults]
graph_sequence = ["clarify"]
resource_budget = 50.0

[[units]]
name = "echo"
kind = "echo"
"#;

const CLARIFY: &str = r#"
name: clarify
steps:
  - { name: ask, type: unit, unit: echo }
  - { name: clarify, type: await, resume_type: answer, reason: awaiting_answer }
  - { name: record, type: unit, unit: echo }
"#;

async fn app() -> (TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pipewright.toml"), CONFIG).unwrap();
    std::fs::create_dir_all(dir.path().join("graphs")).unwrap();
    std::fs::write(dir.path().join("graphs/clarify.yaml"), CLARIFY).unwrap();

    let state = AppState::open_in(dir.path()).await.unwrap();
    (dir, build_router(state))
}

async fn send(app: &Router, method: &str, uri: &str, tenant: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(t) = tenant {
        builder = builder.header("X-Tenant-Id", t);
    }
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

/// Poll until the background run has settled the instance.
async fn wait_for_status(app: &Router, tenant: &str, workflow: &str, expected: &str) -> Value {
    for _ in 0..100 {
        let (status, body) = send(app, "GET", &format!("/api/v1/workflows/{workflow}"), Some(tenant), None).await;
        if status == StatusCode::OK && body["data"]["status"] == expected {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workflow {workflow} never reached {expected}");
}

#[tokio::test]
async fn health_needs_no_tenant() {
    let (_dir, app) = app().await;
    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = send(&app, "GET", "/api/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_tenant_header_is_rejected() {
    let (_dir, app) = app().await;
    let (status, body) = send(&app, "GET", "/api/v1/workflows", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn start_suspend_resume_complete() {
    let (_dir, app) = app().await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/workflows",
        Some("acme"),
        Some(json!({"workflow_id": "W1", "input": {"q": "which db?"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["id"], "W1");
    assert_eq!(body["_links"]["self"], "/api/v1/workflows/W1");

    let suspended = wait_for_status(&app, "acme", "W1", "suspended").await;
    assert_eq!(suspended["data"]["suspension"]["resume_type"], "answer");

    // Wrong event type leaves the workflow waiting.
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/workflows/W1/events",
        Some("acme"),
        Some(json!({"type": "approval"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"][0]["code"], "INVALID_RESUME");
    assert_eq!(body["errors"][0]["details"]["expected"], "answer");

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/workflows/W1/events",
        Some("acme"),
        Some(json!({"type": "answer", "payload": {"text": "sqlite"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["instance"]["status"], "completed");
    assert_eq!(body["data"]["output"], json!({"text": "sqlite"}));

    let (status, body) = send(&app, "GET", "/api/v1/workflows/W1/checkpoints", Some("acme"), None).await;
    assert_eq!(status, StatusCode::OK);
    let records = body["data"].as_array().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1]["status"], "resumed");

    let (status, body) = send(&app, "GET", "/api/v1/tenant", Some("acme"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], "acme");
    assert_eq!(body["data"]["budget_remaining"], 48.0);
}

#[tokio::test]
async fn workflows_are_scoped_to_the_calling_tenant() {
    let (_dir, app) = app().await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/workflows",
        Some("acme"),
        Some(json!({"workflow_id": "TICKET-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_status(&app, "acme", "TICKET-1", "suspended").await;

    let (status, body) = send(&app, "GET", "/api/v1/workflows/TICKET-1", Some("beta"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["errors"][0]["code"], "NOT_FOUND");

    let (_, body) = send(&app, "GET", "/api/v1/workflows", Some("beta"), None).await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let (_, body) = send(&app, "GET", "/api/v1/workflows?status=suspended", Some("acme"), None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "GET", "/api/v1/workflows?status=sleeping", Some("acme"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_start_conflicts_and_cancel_is_final() {
    let (_dir, app) = app().await;
    let start = json!({"workflow_id": "W2"});

    let (status, _) = send(&app, "POST", "/api/v1/workflows", Some("acme"), Some(start.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_status(&app, "acme", "W2", "suspended").await;

    let (status, body) = send(&app, "POST", "/api/v1/workflows", Some("acme"), Some(start)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["errors"][0]["code"], "CONFLICT");

    let (status, body) = send(&app, "POST", "/api/v1/workflows/W2/cancel", Some("acme"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/workflows/W2/events",
        Some("acme"),
        Some(json!({"type": "answer"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
