//! Integration tests for the node control API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use smite_api::{models::*, node_router};
use smite_control::{AdapterManager, AdapterSet, AdapterSettings, TunnelRegistry, UsageCollector, UsageSource};
use smite_proto::TunnelState;
use tempfile::TempDir;
use tower::ServiceExt; // For `oneshot` method

/// Helper to create a node router over a scratch state directory
fn create_test_router() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let settings = AdapterSettings {
        state_dir: dir.path().join("state"),
        sysfs_net_root: dir.path().join("net"),
    };
    let manager = AdapterManager::new(TunnelRegistry::new(), AdapterSet::standard(&settings));
    let collector = UsageCollector::new(manager.clone());
    (dir, node_router(manager, collector))
}

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

fn hysteria_apply(tunnel_id: &str) -> Value {
    json!({
        "tunnel_id": tunnel_id,
        "type": "hysteria2",
        "spec": {"server": "hy.example.com:443", "auth": "secret"}
    })
}

#[tokio::test]
async fn test_apply_then_status() {
    let (dir, app) = create_test_router();

    let (status, body) = send(&app, "POST", "/tunnels/apply", Some(hysteria_apply("h1"))).await;
    assert_eq!(status, StatusCode::OK);
    let applied: TunnelResponse = serde_json::from_value(body).unwrap();
    assert_eq!(applied.status, "success");
    assert_eq!(applied.data.current_state, TunnelState::Active);
    assert!(dir.path().join("state/hysteria2/h1.yaml").exists());

    let (status, body) = send(&app, "GET", "/tunnels/status?tunnel_id=h1", None).await;
    assert_eq!(status, StatusCode::OK);
    let record: TunnelResponse = serde_json::from_value(body).unwrap();
    assert_eq!(record.data.tunnel_id, "h1");
    assert_eq!(record.data.applied_spec.unwrap().get_str("auth"), Some("secret"));
    let backend = record.backend.unwrap();
    assert!(backend.present);

    let (status, body) = send(&app, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "active_tunnels": 1, "tunnels": ["h1"]}));
}

#[tokio::test]
async fn test_apply_failures_are_500_with_code() {
    let (_dir, app) = create_test_router();

    let (status, body) = send(
        &app,
        "POST",
        "/tunnels/apply",
        Some(json!({"tunnel_id": "x1", "type": "openvpn", "spec": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    assert_eq!(error.code, "UNSUPPORTED_TUNNEL_TYPE");
    assert!(!error.retryable);

    let (status, body) = send(
        &app,
        "POST",
        "/tunnels/apply",
        Some(json!({"tunnel_id": "h1", "type": "hysteria2", "spec": {"server": "hy.example.com:443"}})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "INVALID_SPEC");

    // Nothing was recorded for either rejection
    let (_, body) = send(&app, "GET", "/status", None).await;
    assert_eq!(body["active_tunnels"], 0);
    let (status, _) = send(&app, "GET", "/tunnels/status?tunnel_id=h1", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_remove_unknown_then_idempotent() {
    let (_dir, app) = create_test_router();

    let (status, body) = send(&app, "POST", "/tunnels/remove", Some(json!({"tunnel_id": "ghost"}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "TUNNEL_NOT_FOUND");

    send(&app, "POST", "/tunnels/apply", Some(hysteria_apply("h1"))).await;
    for _ in 0..2 {
        let (status, body) = send(&app, "POST", "/tunnels/remove", Some(json!({"tunnel_id": "h1"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["current_state"], "removed");
    }
}

#[tokio::test]
async fn test_usage_push_precedence() {
    let (_dir, app) = create_test_router();

    // Unknown tunnel
    let (status, body) = send(
        &app,
        "POST",
        "/usage/push",
        Some(json!({"tunnel_id": "h1", "bytes_used": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let refused: UsagePushResponse = serde_json::from_value(body).unwrap();
    assert_eq!(refused.status, "error");
    assert!(refused.message.is_some());

    // hysteria2 cannot meter, so the client's figure is accepted
    send(&app, "POST", "/tunnels/apply", Some(hysteria_apply("h1"))).await;
    let (_, body) = send(
        &app,
        "POST",
        "/usage/push",
        Some(json!({"tunnel_id": "h1", "bytes_used": 4096})),
    )
    .await;
    let accepted: UsagePushResponse = serde_json::from_value(body).unwrap();
    assert_eq!(accepted.status, "ok");
    assert_eq!(accepted.bytes_used, Some(4096));
    assert_eq!(accepted.source, Some(UsageSource::Client));

    // The tcp forwarder meters itself and overrides the client
    send(
        &app,
        "POST",
        "/tunnels/apply",
        Some(json!({
            "tunnel_id": "fwd",
            "type": "tcp",
            "spec": {"listen": "127.0.0.1:0", "target": "127.0.0.1:9"}
        })),
    )
    .await;
    let (_, body) = send(
        &app,
        "POST",
        "/usage/push",
        Some(json!({"tunnel_id": "fwd", "bytes_used": 999_999})),
    )
    .await;
    let overridden: UsagePushResponse = serde_json::from_value(body).unwrap();
    assert_eq!(overridden.bytes_used, Some(0));
    assert_eq!(overridden.source, Some(UsageSource::Adapter));
}

#[tokio::test]
async fn test_malformed_bodies_keep_the_error_contract() {
    let (dir, app) = create_test_router();

    // spec must be an object
    let (status, body) = send(
        &app,
        "POST",
        "/tunnels/apply",
        Some(json!({"tunnel_id": "h1", "type": "hysteria2", "spec": [1]})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    assert_eq!(error.code, "INVALID_REQUEST");
    assert!(!error.retryable);
    assert!(!dir.path().join("state/hysteria2/h1.yaml").exists());

    let (status, body) = send(&app, "POST", "/tunnels/remove", Some(json!({"id": "h1"}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert!(body["error"].as_str().unwrap().contains("tunnel_id"));

    // Not JSON at all
    let request = Request::builder()
        .uri("/tunnels/remove")
        .method("POST")
        .body(Body::from("tunnel_id=h1"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let (status, body) = send(
        &app,
        "POST",
        "/usage/push",
        Some(json!({"tunnel_id": "h1", "bytes_used": -5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let refused: UsagePushResponse = serde_json::from_value(body).unwrap();
    assert_eq!(refused.status, "error");
    assert!(refused.bytes_used.is_none());
    assert!(refused.message.is_some());
}

#[tokio::test]
async fn test_openapi_served() {
    let (_dir, app) = create_test_router();
    let (status, body) = send(&app, "GET", "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "Smite Node API");
}
