//! Panel operator API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use smite_panel::Panel;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use crate::error::ApiError;
use crate::models::*;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Smite Panel API",
        version = "0.1.0",
        description = "Drive tunnels on connected nodes and read their usage"
    ),
    paths(list_nodes, apply_tunnel, remove_tunnel, tunnel_status, list_usage, health_check),
    components(schemas(
        ApplyTunnelRequest,
        RemoveTunnelRequest,
        TunnelResponse,
        NodeList,
        UsageList,
        HealthResponse,
        ErrorResponse,
        smite_panel::NodeInfo,
        smite_panel::NodeUsage,
        smite_proto::TunnelRecord,
        smite_proto::TunnelType,
        smite_proto::TunnelState,
    )),
    tags(
        (name = "nodes", description = "Connected nodes"),
        (name = "tunnels", description = "Tunnel lifecycle on a node"),
        (name = "usage", description = "Usage reported by nodes"),
        (name = "system", description = "Panel health")
    )
)]
pub struct PanelApiDoc;

/// Build the panel router
pub fn panel_router(panel: Panel) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/{node_id}/tunnels/apply", post(apply_tunnel))
        .route("/nodes/{node_id}/tunnels/remove", post(remove_tunnel))
        .route("/nodes/{node_id}/tunnels/status", get(tunnel_status))
        .route("/usage", get(list_usage))
        .route("/health", get(health_check))
        .route("/openapi.json", get(openapi))
        .with_state(panel)
        .layer(TraceLayer::new_for_http())
}

/// List connected nodes
#[utoipa::path(
    get,
    path = "/nodes",
    responses(
        (status = 200, description = "Connected nodes", body = NodeList)
    ),
    tag = "nodes"
)]
pub async fn list_nodes(State(panel): State<Panel>) -> Json<NodeList> {
    let nodes = panel.list_nodes();
    let total = nodes.len();
    Json(NodeList { nodes, total })
}

/// Apply a tunnel on a node
#[utoipa::path(
    post,
    path = "/nodes/{node_id}/tunnels/apply",
    params(
        ("node_id" = String, Path, description = "Node ID")
    ),
    request_body = ApplyTunnelRequest,
    responses(
        (status = 200, description = "Tunnel is Active on the node", body = TunnelResponse),
        (status = 404, description = "Node not connected", body = ErrorResponse),
        (status = 500, description = "Malformed body or the node failed the operation", body = ErrorResponse),
        (status = 504, description = "The node did not answer in time", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn apply_tunnel(
    State(panel): State<Panel>,
    Path(node_id): Path<String>,
    payload: Result<Json<ApplyTunnelRequest>, JsonRejection>,
) -> Result<Json<TunnelResponse>, ApiError> {
    let Json(req) = payload?;
    info!(node_id = %node_id, tunnel_id = %req.tunnel_id, tunnel_type = %req.tunnel_type, "Apply requested");

    let reply = panel
        .apply_tunnel(&node_id, &req.tunnel_id, &req.tunnel_type, req.spec)
        .await?;
    Ok(Json(TunnelResponse::success(reply.record)))
}

/// Remove a tunnel from a node
#[utoipa::path(
    post,
    path = "/nodes/{node_id}/tunnels/remove",
    params(
        ("node_id" = String, Path, description = "Node ID")
    ),
    request_body = RemoveTunnelRequest,
    responses(
        (status = 200, description = "Tunnel is Removed on the node", body = TunnelResponse),
        (status = 404, description = "Node not connected", body = ErrorResponse),
        (status = 500, description = "Malformed body or the node failed the operation", body = ErrorResponse),
        (status = 504, description = "The node did not answer in time", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn remove_tunnel(
    State(panel): State<Panel>,
    Path(node_id): Path<String>,
    payload: Result<Json<RemoveTunnelRequest>, JsonRejection>,
) -> Result<Json<TunnelResponse>, ApiError> {
    let Json(req) = payload?;
    info!(node_id = %node_id, tunnel_id = %req.tunnel_id, "Remove requested");

    let reply = panel.remove_tunnel(&node_id, &req.tunnel_id).await?;
    let mut response = TunnelResponse::success(reply.record);
    response.warning = reply.warning;
    Ok(Json(response))
}

/// Tunnel record as the node sees it
#[utoipa::path(
    get,
    path = "/nodes/{node_id}/tunnels/status",
    params(
        ("node_id" = String, Path, description = "Node ID"),
        TunnelQuery
    ),
    responses(
        (status = 200, description = "Tunnel record", body = TunnelResponse),
        (status = 404, description = "Node not connected", body = ErrorResponse),
        (status = 500, description = "Unknown tunnel", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn tunnel_status(
    State(panel): State<Panel>,
    Path(node_id): Path<String>,
    Query(query): Query<TunnelQuery>,
) -> Result<Json<TunnelResponse>, ApiError> {
    let reply = panel.tunnel_status(&node_id, &query.tunnel_id).await?;
    Ok(Json(TunnelResponse::success(reply.record)))
}

/// Latest usage reported by nodes
#[utoipa::path(
    get,
    path = "/usage",
    params(UsageQuery),
    responses(
        (status = 200, description = "Usage per node and tunnel", body = UsageList)
    ),
    tag = "usage"
)]
pub async fn list_usage(State(panel): State<Panel>, Query(query): Query<UsageQuery>) -> Json<UsageList> {
    let usage = match query.node_id {
        Some(node_id) => panel.ledger().for_node(&node_id),
        None => panel.ledger().list(),
    };
    let total = usage.len();
    Json(UsageList { usage, total })
}

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Panel is running", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(panel): State<Panel>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_nodes: panel.nodes().count(),
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(PanelApiDoc::openapi())
}
