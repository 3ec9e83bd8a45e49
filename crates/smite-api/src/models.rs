use serde::{Deserialize, Serialize};
use smite_control::{BackendStatus, UsageSource};
use smite_panel::{NodeInfo, NodeUsage};
use smite_proto::{TunnelRecord, TunnelSpec};
use utoipa::{IntoParams, ToSchema};

/// Request to apply a tunnel intent
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApplyTunnelRequest {
    /// Tunnel identifier, unique per node
    pub tunnel_id: String,
    /// Tunnel technology (`wireguard`, `hysteria2`, `tcp`)
    #[serde(rename = "type")]
    pub tunnel_type: String,
    /// Type-specific configuration
    #[serde(default)]
    #[schema(value_type = Object)]
    pub spec: TunnelSpec,
}

/// Request to remove a tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RemoveTunnelRequest {
    pub tunnel_id: String,
}

/// Query selecting one tunnel
#[derive(Debug, Clone, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TunnelQuery {
    /// Tunnel identifier
    pub tunnel_id: String,
}

/// Result of a tunnel operation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelResponse {
    /// Always `success`
    pub status: String,
    pub data: TunnelRecord,
    /// What the backend reports (status queries on the node only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub backend: Option<BackendStatus>,
    /// Teardown problem that did not block a removal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl TunnelResponse {
    pub fn success(data: TunnelRecord) -> Self {
        Self {
            status: "success".to_string(),
            data,
            backend: None,
            warning: None,
        }
    }
}

/// Client-reported usage for a tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsagePushRequest {
    pub tunnel_id: String,
    pub bytes_used: u64,
}

/// Outcome of a usage push
///
/// `status` is `ok` with the authoritative `bytes_used` and its `source`,
/// or `error` with a `message`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsagePushResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_used: Option<u64>,
    /// `adapter` or `client`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub source: Option<UsageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UsagePushResponse {
    pub fn ok(bytes_used: u64, source: UsageSource) -> Self {
        Self {
            status: "ok".to_string(),
            bytes_used: Some(bytes_used),
            source: Some(source),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            bytes_used: None,
            source: None,
            message: Some(message.into()),
        }
    }
}

/// Node status summary
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeStatusResponse {
    pub status: String,
    /// Number of Active tunnels
    pub active_tunnels: usize,
    /// Ids of Active tunnels
    pub tunnels: Vec<String>,
}

/// Connected nodes
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeList {
    pub nodes: Vec<NodeInfo>,
    pub total: usize,
}

/// Query filtering usage by node
#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UsageQuery {
    /// Only usage reported by this node
    pub node_id: Option<String>,
}

/// Latest usage per node and tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageList {
    pub usage: Vec<NodeUsage>,
    pub total: usize,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Connected nodes count
    pub connected_nodes: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Machine readable error code
    pub code: String,
    /// Whether the same request may succeed later
    pub retryable: bool,
}
