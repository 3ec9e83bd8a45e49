//! Integration tests for the panel operator API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use smite_api::{models::*, panel_router};
use smite_panel::Panel;
use smite_proto::UsageSample;
use tower::ServiceExt; // For `oneshot` method

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).method(method);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

fn sample(tunnel_id: &str, bytes: u64) -> UsageSample {
    UsageSample {
        tunnel_id: tunnel_id.to_string(),
        bytes_used: bytes,
        sampled_at: Utc::now(),
        generation: 1,
    }
}

#[tokio::test]
async fn test_health_and_empty_nodes() {
    let app = panel_router(Panel::new());

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.connected_nodes, 0);

    let (status, body) = send(&app, "GET", "/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    let nodes: NodeList = serde_json::from_value(body).unwrap();
    assert_eq!(nodes.total, 0);
}

#[tokio::test]
async fn test_operations_on_disconnected_node() {
    let app = panel_router(Panel::new());

    let (status, body) = send(
        &app,
        "POST",
        "/nodes/node-1/tunnels/apply",
        Some(json!({"tunnel_id": "h1", "type": "hysteria2", "spec": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    assert_eq!(error.code, "NODE_NOT_CONNECTED");
    assert!(error.retryable);

    let (status, _) = send(&app, "POST", "/nodes/node-1/tunnels/remove", Some(json!({"tunnel_id": "h1"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "GET", "/nodes/node-1/tunnels/status?tunnel_id=h1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NODE_NOT_CONNECTED");
}

#[tokio::test]
async fn test_malformed_body_is_refused_before_reaching_the_node() {
    let app = panel_router(Panel::new());

    let (status, body) = send(
        &app,
        "POST",
        "/nodes/node-1/tunnels/apply",
        Some(json!({"type": "hysteria2", "spec": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    assert_eq!(error.code, "INVALID_REQUEST");
    assert!(!error.retryable);

    let (status, body) = send(&app, "POST", "/nodes/node-1/tunnels/remove", Some(json!([]))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_usage_listing() {
    let panel = Panel::new();
    panel.ledger().record("node-2", vec![sample("t1", 7)]);
    panel.ledger().record("node-1", vec![sample("t1", 9), sample("t2", 3)]);
    let app = panel_router(panel);

    let (status, body) = send(&app, "GET", "/usage", None).await;
    assert_eq!(status, StatusCode::OK);
    let usage: UsageList = serde_json::from_value(body).unwrap();
    assert_eq!(usage.total, 3);
    assert_eq!(usage.usage[0].node_id, "node-1");
    assert_eq!(usage.usage[0].bytes_used, 9);

    let (_, body) = send(&app, "GET", "/usage?node_id=node-2", None).await;
    let usage: UsageList = serde_json::from_value(body).unwrap();
    assert_eq!(usage.total, 1);
    assert_eq!(usage.usage[0].bytes_used, 7);
}

#[tokio::test]
async fn test_openapi_served() {
    let app = panel_router(Panel::new());
    let (status, body) = send(&app, "GET", "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "Smite Panel API");
}
