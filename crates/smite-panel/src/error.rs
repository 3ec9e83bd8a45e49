use smite_transport_quic::ChannelError;
use std::time::Duration;
use thiserror::Error;

/// Errors from driving nodes
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("Node {0} is not connected")]
    NodeNotConnected(String),

    #[error("{operation} on node {node_id} timed out after {timeout:?}")]
    Timeout {
        node_id: String,
        operation: &'static str,
        timeout: Duration,
    },

    /// The node processed the request and reported a failure
    #[error("{message}")]
    Node {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl PanelError {
    pub fn code(&self) -> &str {
        match self {
            PanelError::NodeNotConnected(_) => "NODE_NOT_CONNECTED",
            PanelError::Timeout { .. } => "TIMEOUT",
            PanelError::Node { code, .. } => code,
            PanelError::Channel(_) => "CHANNEL_ERROR",
            PanelError::Protocol(_) => "PROTOCOL_ERROR",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            PanelError::NodeNotConnected(_) | PanelError::Timeout { .. } => true,
            PanelError::Node { retryable, .. } => *retryable,
            PanelError::Channel(e) => e.is_retryable(),
            PanelError::Protocol(_) => false,
        }
    }
}
