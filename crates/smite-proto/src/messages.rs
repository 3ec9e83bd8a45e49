//! Secure channel message types

use serde::{Deserialize, Serialize};

use crate::tunnel::{TunnelRecord, TunnelSpec, UsageSample};

/// Messages exchanged between panel and node over the secure channel
///
/// The node opens the control stream and sends `Hello`. Every other
/// exchange uses a fresh bidirectional stream carrying one request and one
/// reply: the panel opens streams for tunnel operations, the node opens
/// streams for usage reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChannelMessage {
    // Control stream
    Hello {
        node_id: String,
        protocol_version: u32,
        metadata: NodeMetadata,
    },
    HelloAck {
        node_id: String,
    },
    Rejected {
        reason: String,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },

    // Panel -> node tunnel operations.
    // `tunnel_type` stays a string so that a node can reject types it does
    // not support with a typed error instead of a decode failure.
    ApplyTunnel {
        tunnel_id: String,
        tunnel_type: String,
        spec: TunnelSpec,
    },
    RemoveTunnel {
        tunnel_id: String,
    },
    GetTunnelStatus {
        tunnel_id: String,
    },

    // Node -> panel replies
    TunnelResult {
        record: TunnelRecord,
        /// Backend teardown problem that did not block a removal
        warning: Option<String>,
    },
    OperationFailed {
        tunnel_id: String,
        code: String,
        message: String,
        retryable: bool,
    },

    // Node -> panel usage stream
    UsageReport {
        node_id: String,
        samples: Vec<UsageSample>,
    },
    UsageAck {
        accepted: u32,
    },
}

impl ChannelMessage {
    /// Short name used in logs and protocol errors
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::Hello { .. } => "Hello",
            ChannelMessage::HelloAck { .. } => "HelloAck",
            ChannelMessage::Rejected { .. } => "Rejected",
            ChannelMessage::Ping { .. } => "Ping",
            ChannelMessage::Pong { .. } => "Pong",
            ChannelMessage::ApplyTunnel { .. } => "ApplyTunnel",
            ChannelMessage::RemoveTunnel { .. } => "RemoveTunnel",
            ChannelMessage::GetTunnelStatus { .. } => "GetTunnelStatus",
            ChannelMessage::TunnelResult { .. } => "TunnelResult",
            ChannelMessage::OperationFailed { .. } => "OperationFailed",
            ChannelMessage::UsageReport { .. } => "UsageReport",
            ChannelMessage::UsageAck { .. } => "UsageAck",
        }
    }
}

/// Node metadata for identification and monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMetadata {
    pub hostname: String,
    pub platform: String,
    pub version: String,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
