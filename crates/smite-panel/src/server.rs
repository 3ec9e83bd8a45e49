//! Accepts node connections on the secure channel

use crate::ledger::UsageLedger;
use crate::nodes::{ConnectedNode, NodeInfo, NodeRegistry};
use crate::panel::Panel;
use smite_proto::{ChannelMessage, NodeMetadata, PROTOCOL_VERSION};
use smite_transport_quic::{ChannelConnection, ChannelListener, ChannelResult, ChannelStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a new connection has to send its Hello
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PanelServer {
    listener: Arc<ChannelListener>,
    nodes: NodeRegistry,
    ledger: UsageLedger,
    hello_timeout: Duration,
}

impl PanelServer {
    pub fn new(listener: ChannelListener, panel: &Panel) -> Self {
        Self {
            listener: Arc::new(listener),
            nodes: panel.nodes().clone(),
            ledger: panel.ledger().clone(),
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }

    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> ChannelResult<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve node connections until the listener closes
    pub async fn run(&self) -> ChannelResult<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Panel channel listening");

        loop {
            let (connection, peer_addr) = self.listener.accept().await?;
            let handler = ConnectionHandler {
                nodes: self.nodes.clone(),
                ledger: self.ledger.clone(),
                hello_timeout: self.hello_timeout,
            };
            tokio::spawn(async move {
                handler.handle_connection(connection, peer_addr).await;
            });
        }
    }

    pub fn close(&self) {
        self.listener.close();
    }
}

struct ConnectionHandler {
    nodes: NodeRegistry,
    ledger: UsageLedger,
    hello_timeout: Duration,
}

impl ConnectionHandler {
    async fn handle_connection(&self, connection: ChannelConnection, peer_addr: SocketAddr) {
        info!(peer = %peer_addr, connection_id = %connection.connection_id(), "New node connection");

        let (node_id, metadata) =
            match tokio::time::timeout(self.hello_timeout, self.read_hello(&connection)).await {
                Ok(Some(hello)) => hello,
                Ok(None) => {
                    connection.close(1, "handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(peer = %peer_addr, "No Hello within {:?}", self.hello_timeout);
                    connection.close(1, "hello timeout");
                    return;
                }
            };

        let info = NodeInfo::new(
            &node_id,
            metadata,
            peer_addr.to_string(),
            connection.connection_id(),
        );
        if let Some(old) = self.nodes.register_or_replace(ConnectedNode {
            info,
            connection: connection.clone(),
        }) {
            old.connection.close(0, "replaced by new connection");
        }

        self.serve(&node_id, &connection).await;

        self.nodes
            .unregister_if(&node_id, connection.connection_id());
        info!(node_id = %node_id, uptime_secs = connection.uptime_secs(), "Node disconnected");
    }

    /// Read and check the Hello; replies HelloAck or Rejected
    async fn read_hello(&self, connection: &ChannelConnection) -> Option<(String, NodeMetadata)> {
        let mut control = match connection.accept_stream().await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                debug!("Connection closed before control stream");
                return None;
            }
            Err(e) => {
                error!("Failed to accept control stream: {}", e);
                return None;
            }
        };

        let (node_id, protocol_version, metadata) = match control.recv_message().await {
            Ok(Some(ChannelMessage::Hello {
                node_id,
                protocol_version,
                metadata,
            })) => (node_id, protocol_version, metadata),
            Ok(Some(other)) => {
                error!("Unexpected first message: {}", other.kind());
                reject(&mut control, "expected Hello").await;
                return None;
            }
            Ok(None) => {
                debug!("Control stream closed before Hello");
                return None;
            }
            Err(e) => {
                error!("Failed to read Hello: {}", e);
                return None;
            }
        };

        if protocol_version != PROTOCOL_VERSION {
            warn!(node_id = %node_id, protocol_version, "Unsupported protocol version");
            reject(
                &mut control,
                &format!("unsupported protocol version {}", protocol_version),
            )
            .await;
            return None;
        }

        let common_name = match connection.peer_common_name() {
            Ok(cn) => cn,
            Err(e) => {
                error!(node_id = %node_id, "Cannot read peer certificate: {}", e);
                reject(&mut control, "peer certificate unreadable").await;
                return None;
            }
        };
        if common_name != node_id {
            warn!(
                node_id = %node_id,
                certificate_cn = %common_name,
                "Node id does not match certificate"
            );
            reject(
                &mut control,
                &format!("certificate is issued to '{}', not '{}'", common_name, node_id),
            )
            .await;
            return None;
        }

        if let Err(e) = control
            .send_message(&ChannelMessage::HelloAck {
                node_id: node_id.clone(),
            })
            .await
        {
            error!(node_id = %node_id, "Failed to send HelloAck: {}", e);
            return None;
        }

        info!(
            node_id = %node_id,
            hostname = %metadata.hostname,
            version = %metadata.version,
            "Node registered"
        );
        Some((node_id, metadata))
    }

    /// Handle node-opened streams until the connection closes
    async fn serve(&self, node_id: &str, connection: &ChannelConnection) {
        loop {
            match connection.accept_stream().await {
                Ok(Some(stream)) => {
                    let node_id = node_id.to_string();
                    let ledger = self.ledger.clone();
                    tokio::spawn(async move {
                        handle_node_stream(&node_id, stream, &ledger).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(node_id, "Connection ended: {}", e);
                    break;
                }
            }
        }
    }
}

async fn handle_node_stream(node_id: &str, mut stream: ChannelStream, ledger: &UsageLedger) {
    let reply = match stream.recv_message().await {
        Ok(Some(ChannelMessage::UsageReport {
            node_id: reported,
            samples,
        })) => {
            if reported != node_id {
                warn!(node_id, reported = %reported, "Usage report for another node ignored");
                ChannelMessage::UsageAck { accepted: 0 }
            } else {
                let count = samples.len();
                let accepted = ledger.record(node_id, samples);
                debug!(node_id, count, accepted, "Usage report recorded");
                ChannelMessage::UsageAck { accepted }
            }
        }
        Ok(Some(other)) => {
            warn!(node_id, kind = other.kind(), "Unexpected node request");
            ChannelMessage::OperationFailed {
                tunnel_id: String::new(),
                code: "UNEXPECTED_MESSAGE".to_string(),
                message: format!("panel does not handle {}", other.kind()),
                retryable: false,
            }
        }
        Ok(None) => return,
        Err(e) => {
            error!(node_id, "Failed to read node request: {}", e);
            return;
        }
    };

    if let Err(e) = stream.send_message(&reply).await {
        error!(node_id, "Failed to send reply: {}", e);
        return;
    }
    let _ = stream.finish();
}

async fn reject(control: &mut ChannelStream, reason: &str) {
    let _ = control
        .send_message(&ChannelMessage::Rejected {
            reason: reason.to_string(),
        })
        .await;
    let _ = control.finish();
    // Give QUIC time to deliver the rejection before the connection closes
    tokio::time::sleep(Duration::from_millis(50)).await;
}
