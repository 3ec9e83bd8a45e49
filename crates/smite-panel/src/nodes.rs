//! Registry of nodes currently connected to the panel
//!
//! A node id has at most one live connection. A reconnecting node replaces
//! its stale entry, and the stale connection's cleanup must not remove the
//! new one, so removal is keyed on the connection id as well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smite_proto::NodeMetadata;
use smite_transport_quic::ChannelConnection;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// What the panel knows about a connected node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct NodeInfo {
    pub node_id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub remote_addr: String,
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(node_id: &str, metadata: NodeMetadata, remote_addr: String, connection_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            hostname: metadata.hostname,
            platform: metadata.platform,
            version: metadata.version,
            remote_addr,
            connection_id: connection_id.to_string(),
            connected_at: Utc::now(),
        }
    }
}

/// A registered node with the channel to reach it
#[derive(Debug, Clone)]
pub struct ConnectedNode<C = ChannelConnection> {
    pub info: NodeInfo,
    pub connection: C,
}

#[derive(Debug)]
pub struct NodeRegistry<C = ChannelConnection> {
    nodes: Arc<RwLock<HashMap<String, ConnectedNode<C>>>>,
}

impl<C> Clone for NodeRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
        }
    }
}

impl<C> Default for NodeRegistry<C> {
    fn default() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<C: Clone> NodeRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ConnectedNode<C>>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ConnectedNode<C>>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a node, replacing any previous connection for the same id
    ///
    /// Returns the replaced entry so the caller can close its connection.
    pub fn register_or_replace(&self, node: ConnectedNode<C>) -> Option<ConnectedNode<C>> {
        let node_id = node.info.node_id.clone();
        let replaced = self.write().insert(node_id.clone(), node);

        match &replaced {
            Some(old) => info!(
                node_id = %node_id,
                old_connection_id = %old.info.connection_id,
                old_connected_at = %old.info.connected_at,
                "Re-registered node (replaced stale connection)"
            ),
            None => info!(node_id = %node_id, "Registered new node"),
        }
        replaced
    }

    /// Remove a node only if it is still registered with `connection_id`
    pub fn unregister_if(&self, node_id: &str, connection_id: &str) -> bool {
        let mut nodes = self.write();
        let current = nodes
            .get(node_id)
            .is_some_and(|n| n.info.connection_id == connection_id);
        if current {
            nodes.remove(node_id);
            info!(node_id, connection_id, "Unregistered node");
        } else {
            debug!(node_id, connection_id, "Connection already superseded; registry unchanged");
        }
        current
    }

    pub fn get(&self, node_id: &str) -> Option<ConnectedNode<C>> {
        self.read().get(node_id).cloned()
    }

    /// Connected nodes ordered by id
    pub fn list(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<_> = self.read().values().map(|n| n.info.clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }
}
