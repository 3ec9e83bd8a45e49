use crate::error::PanelError;
use crate::ledger::UsageLedger;
use crate::nodes::{NodeInfo, NodeRegistry};
use smite_proto::{ChannelMessage, TunnelRecord, TunnelSpec};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Upper bound on a single request to a node
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A node's answer to a tunnel operation
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelReply {
    pub record: TunnelRecord,
    /// Backend teardown problem reported alongside a successful removal
    pub warning: Option<String>,
}

/// Drives tunnels on connected nodes
#[derive(Debug, Clone)]
pub struct Panel {
    nodes: NodeRegistry,
    ledger: UsageLedger,
    request_timeout: Duration,
}

impl Default for Panel {
    fn default() -> Self {
        Self::new()
    }
}

impl Panel {
    pub fn new() -> Self {
        Self {
            nodes: NodeRegistry::new(),
            ledger: UsageLedger::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.nodes.list()
    }

    pub async fn apply_tunnel(
        &self,
        node_id: &str,
        tunnel_id: &str,
        tunnel_type: &str,
        spec: TunnelSpec,
    ) -> Result<TunnelReply, PanelError> {
        info!(node_id, tunnel_id, tunnel_type, "Applying tunnel");
        let message = ChannelMessage::ApplyTunnel {
            tunnel_id: tunnel_id.to_string(),
            tunnel_type: tunnel_type.to_string(),
            spec,
        };
        self.tunnel_request(node_id, "apply", message).await
    }

    pub async fn remove_tunnel(&self, node_id: &str, tunnel_id: &str) -> Result<TunnelReply, PanelError> {
        info!(node_id, tunnel_id, "Removing tunnel");
        let message = ChannelMessage::RemoveTunnel {
            tunnel_id: tunnel_id.to_string(),
        };
        let reply = self.tunnel_request(node_id, "remove", message).await?;
        if let Some(warning) = &reply.warning {
            warn!(node_id, tunnel_id, "Tunnel removed with backend warning: {}", warning);
        }
        Ok(reply)
    }

    pub async fn tunnel_status(&self, node_id: &str, tunnel_id: &str) -> Result<TunnelReply, PanelError> {
        let message = ChannelMessage::GetTunnelStatus {
            tunnel_id: tunnel_id.to_string(),
        };
        self.tunnel_request(node_id, "status", message).await
    }

    /// Round trip time to a node
    pub async fn ping(&self, node_id: &str) -> Result<Duration, PanelError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let started = Instant::now();
        match self
            .request(node_id, "ping", ChannelMessage::Ping { timestamp })
            .await?
        {
            ChannelMessage::Pong { timestamp: echoed } if echoed == timestamp => Ok(started.elapsed()),
            ChannelMessage::Pong { .. } => Err(PanelError::Protocol("Pong timestamp mismatch".into())),
            other => Err(PanelError::Protocol(format!("expected Pong, got {}", other.kind()))),
        }
    }

    async fn tunnel_request(
        &self,
        node_id: &str,
        operation: &'static str,
        message: ChannelMessage,
    ) -> Result<TunnelReply, PanelError> {
        match self.request(node_id, operation, message).await? {
            ChannelMessage::TunnelResult { record, warning } => Ok(TunnelReply { record, warning }),
            ChannelMessage::OperationFailed {
                code,
                message,
                retryable,
                ..
            } => Err(PanelError::Node {
                code,
                message,
                retryable,
            }),
            other => Err(PanelError::Protocol(format!(
                "unexpected reply to {}: {}",
                operation,
                other.kind()
            ))),
        }
    }

    /// One request and one reply on a fresh stream, bounded by the request timeout
    async fn request(
        &self,
        node_id: &str,
        operation: &'static str,
        message: ChannelMessage,
    ) -> Result<ChannelMessage, PanelError> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| PanelError::NodeNotConnected(node_id.to_string()))?;

        let exchange = async {
            let mut stream = node.connection.open_stream().await?;
            stream.request(&message).await
        };

        let reply = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| PanelError::Timeout {
                node_id: node_id.to_string(),
                operation,
                timeout: self.request_timeout,
            })??;

        debug!(node_id, operation, reply = reply.kind(), "Node replied");
        Ok(reply)
    }
}
