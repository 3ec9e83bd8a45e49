//! Node control API

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    routing::{get, post},
    Json, Router,
};
use smite_control::{AdapterManager, UsageCollector};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use utoipa::OpenApi;

use crate::error::ApiError;
use crate::models::*;

/// State shared by the node handlers
pub struct NodeState {
    pub manager: AdapterManager,
    pub collector: UsageCollector,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Smite Node API",
        version = "0.1.0",
        description = "Apply, remove and inspect tunnels on this node"
    ),
    paths(apply_tunnel, remove_tunnel, tunnel_status, push_usage, node_status),
    components(schemas(
        ApplyTunnelRequest,
        RemoveTunnelRequest,
        TunnelResponse,
        UsagePushRequest,
        UsagePushResponse,
        NodeStatusResponse,
        ErrorResponse,
        smite_proto::TunnelRecord,
        smite_proto::TunnelType,
        smite_proto::TunnelState,
    )),
    tags(
        (name = "tunnels", description = "Tunnel lifecycle"),
        (name = "usage", description = "Usage reporting"),
        (name = "system", description = "Node status")
    )
)]
pub struct NodeApiDoc;

/// Build the node router
pub fn node_router(manager: AdapterManager, collector: UsageCollector) -> Router {
    let state = Arc::new(NodeState { manager, collector });

    Router::new()
        .route("/tunnels/apply", post(apply_tunnel))
        .route("/tunnels/remove", post(remove_tunnel))
        .route("/tunnels/status", get(tunnel_status))
        .route("/usage/push", post(push_usage))
        .route("/status", get(node_status))
        .route("/openapi.json", get(openapi))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Apply a tunnel intent
#[utoipa::path(
    post,
    path = "/tunnels/apply",
    request_body = ApplyTunnelRequest,
    responses(
        (status = 200, description = "Tunnel is Active", body = TunnelResponse),
        (status = 500, description = "Malformed body or apply failed", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn apply_tunnel(
    State(state): State<Arc<NodeState>>,
    payload: Result<Json<ApplyTunnelRequest>, JsonRejection>,
) -> Result<Json<TunnelResponse>, ApiError> {
    let Json(req) = payload?;
    info!(tunnel_id = %req.tunnel_id, tunnel_type = %req.tunnel_type, "Apply requested");

    let record = state
        .manager
        .apply_tunnel(&req.tunnel_id, &req.tunnel_type, req.spec)
        .await?;
    Ok(Json(TunnelResponse::success(record)))
}

/// Remove a tunnel
#[utoipa::path(
    post,
    path = "/tunnels/remove",
    request_body = RemoveTunnelRequest,
    responses(
        (status = 200, description = "Tunnel is Removed", body = TunnelResponse),
        (status = 500, description = "Malformed body, unknown tunnel or remove failed", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn remove_tunnel(
    State(state): State<Arc<NodeState>>,
    payload: Result<Json<RemoveTunnelRequest>, JsonRejection>,
) -> Result<Json<TunnelResponse>, ApiError> {
    let Json(req) = payload?;
    info!(tunnel_id = %req.tunnel_id, "Remove requested");

    let outcome = state.manager.remove_tunnel(&req.tunnel_id).await?;
    let mut response = TunnelResponse::success(outcome.record);
    response.warning = outcome.teardown_error.map(|e| e.to_string());
    Ok(Json(response))
}

/// Current record of a tunnel
#[utoipa::path(
    get,
    path = "/tunnels/status",
    params(TunnelQuery),
    responses(
        (status = 200, description = "Tunnel record", body = TunnelResponse),
        (status = 500, description = "Unknown tunnel", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn tunnel_status(
    State(state): State<Arc<NodeState>>,
    Query(query): Query<TunnelQuery>,
) -> Result<Json<TunnelResponse>, ApiError> {
    debug!(tunnel_id = %query.tunnel_id, "Status requested");

    let record = state.manager.get_tunnel_status(&query.tunnel_id)?;
    let backend = match state.manager.backend_status(&query.tunnel_id).await {
        Ok(backend) => Some(backend),
        Err(e) => {
            warn!(tunnel_id = %query.tunnel_id, error = %e, "Backend status unavailable");
            None
        }
    };

    let mut response = TunnelResponse::success(record);
    response.backend = backend;
    Ok(Json(response))
}

/// Report client-side usage; the node's own meter takes precedence
#[utoipa::path(
    post,
    path = "/usage/push",
    request_body = UsagePushRequest,
    responses(
        (status = 200, description = "Authoritative usage, or an error status", body = UsagePushResponse)
    ),
    tag = "usage"
)]
pub async fn push_usage(
    State(state): State<Arc<NodeState>>,
    payload: Result<Json<UsagePushRequest>, JsonRejection>,
) -> Json<UsagePushResponse> {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(e) => {
            debug!(error = %e.body_text(), "Usage push body refused");
            return Json(UsagePushResponse::error(e.body_text()));
        }
    };
    match state.collector.reconcile(&req.tunnel_id, req.bytes_used).await {
        Ok((sample, source)) => Json(UsagePushResponse::ok(sample.bytes_used, source)),
        Err(e) => {
            debug!(tunnel_id = %req.tunnel_id, error = %e, "Usage push refused");
            Json(UsagePushResponse::error(e.to_string()))
        }
    }
}

/// Active tunnels on this node
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, description = "Node status", body = NodeStatusResponse)
    ),
    tag = "system"
)]
pub async fn node_status(State(state): State<Arc<NodeState>>) -> Json<NodeStatusResponse> {
    let tunnels = state.manager.registry().active_ids();
    Json(NodeStatusResponse {
        status: "ok".to_string(),
        active_tunnels: tunnels.len(),
        tunnels,
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(NodeApiDoc::openapi())
}
