use crate::dispatch::handle_stream;
use crate::reconnect::{Backoff, ReconnectConfig, ReconnectError};
use async_trait::async_trait;
use smite_control::{AdapterManager, UsageCollector, UsageSink};
use smite_proto::{ChannelMessage, NodeMetadata, UsageSample, PROTOCOL_VERSION};
use smite_transport_quic::{ChannelConnection, ChannelError, SecureChannelManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Panel rejected this node: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Node certificate is for '{actual}', configured node id is '{expected}'")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Address resolution failed: {0}")]
    AddressResolution(String),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

impl AgentError {
    /// Whether reconnecting could help
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Channel(e) => e.is_retryable(),
            AgentError::Protocol(_) | AgentError::AddressResolution(_) => true,
            AgentError::Rejected(_)
            | AgentError::IdentityMismatch { .. }
            | AgentError::Reconnect(_) => false,
        }
    }
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Must equal the CN of the node certificate
    pub node_id: String,

    /// Panel channel address (host:port)
    pub panel_addr: String,

    /// Name the panel certificate is checked against
    pub panel_server_name: String,

    /// How often Active tunnels are sampled and reported
    pub usage_interval: Duration,

    /// Upper bound on waiting for a panel reply (HelloAck, UsageAck)
    pub request_timeout: Duration,

    pub reconnect: ReconnectConfig,
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, panel_addr: impl Into<String>) -> Self {
        let panel_addr = panel_addr.into();
        let panel_server_name = panel_addr
            .rsplit_once(':')
            .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or("localhost")
            .to_string();

        Self {
            node_id: node_id.into(),
            panel_addr,
            panel_server_name,
            usage_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// The node agent - keeps a channel to the panel and serves its requests
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    channel: Arc<SecureChannelManager>,
    manager: AdapterManager,
    collector: UsageCollector,
}

impl Agent {
    /// Create an agent; fails if the node certificate belongs to another node
    pub fn new(
        config: AgentConfig,
        channel: SecureChannelManager,
        manager: AdapterManager,
        collector: UsageCollector,
    ) -> Result<Self, AgentError> {
        let identity = channel.ensure_identity()?;
        if identity.info.subject_cn != config.node_id {
            return Err(AgentError::IdentityMismatch {
                expected: config.node_id,
                actual: identity.info.subject_cn,
            });
        }

        Ok(Self {
            config,
            channel: Arc::new(channel),
            manager,
            collector,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Stay connected to the panel until a non-retryable error
    ///
    /// Runs until the surrounding task is dropped.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            match self.run_session().await {
                Ok(()) => {
                    info!(node_id = %self.config.node_id, "Panel channel closed");
                    backoff.reset();
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        node_id = %self.config.node_id,
                        error = %e,
                        attempt = backoff.attempt() + 1,
                        "Panel session failed, reconnecting"
                    );
                }
                Err(e) => {
                    error!(node_id = %self.config.node_id, error = %e, "Panel session failed");
                    return Err(e);
                }
            }
            backoff.wait().await?;
        }
    }

    async fn resolve_panel(&self) -> Result<SocketAddr, AgentError> {
        tokio::net::lookup_host(&self.config.panel_addr)
            .await
            .map_err(|e| {
                AgentError::AddressResolution(format!("{}: {}", self.config.panel_addr, e))
            })?
            .next()
            .ok_or_else(|| {
                AgentError::AddressResolution(format!("No addresses found for {}", self.config.panel_addr))
            })
    }

    /// One connected session: handshake, then serve until the channel drops
    ///
    /// `Ok` means the session was established and later ended.
    pub async fn run_session(&self) -> Result<(), AgentError> {
        let addr = self.resolve_panel().await?;
        info!(node_id = %self.config.node_id, panel = %addr, "Connecting to panel");

        let connection = self
            .channel
            .open_channel(addr, &self.config.panel_server_name)
            .await?;
        self.register(&connection).await?;

        let sink = ChannelUsageSink {
            node_id: self.config.node_id.clone(),
            connection: connection.clone(),
            timeout: self.config.request_timeout,
        };

        tokio::select! {
            result = self.serve(&connection) => result,
            _ = self.collector.run(self.config.usage_interval, &sink) => Ok(()),
        }
    }

    async fn register(&self, connection: &ChannelConnection) -> Result<(), AgentError> {
        let mut control = connection.open_stream().await?;
        control
            .send_message(&ChannelMessage::Hello {
                node_id: self.config.node_id.clone(),
                protocol_version: PROTOCOL_VERSION,
                metadata: NodeMetadata::default(),
            })
            .await?;

        let reply = within(self.config.request_timeout, "HelloAck", control.expect_message()).await?;
        match reply {
            ChannelMessage::HelloAck { node_id } if node_id == self.config.node_id => {
                info!(node_id = %node_id, connection_id = %connection.connection_id(), "Registered with panel");
                Ok(())
            }
            ChannelMessage::Rejected { reason } => {
                connection.close(1, "rejected");
                Err(AgentError::Rejected(reason))
            }
            other => Err(AgentError::Protocol(format!(
                "expected HelloAck, got {}",
                other.kind()
            ))),
        }
    }

    /// Accept panel-opened streams until the connection closes
    async fn serve(&self, connection: &ChannelConnection) -> Result<(), AgentError> {
        while let Some(stream) = connection.accept_stream().await? {
            debug!(stream_id = stream.stream_id(), "Panel request stream accepted");
            tokio::spawn(handle_stream(stream, self.manager.clone()));
        }
        Ok(())
    }
}

/// Wait for a panel reply, failing with a retryable timeout
async fn within<T>(
    timeout: Duration,
    waiting_for: &str,
    reply: impl Future<Output = Result<T, ChannelError>>,
) -> Result<T, ChannelError> {
    tokio::time::timeout(timeout, reply).await.map_err(|_| {
        ChannelError::Timeout(format!("no {} from panel within {:?}", waiting_for, timeout))
    })?
}

/// Sends usage batches to the panel, one stream per batch
struct ChannelUsageSink {
    node_id: String,
    connection: ChannelConnection,
    timeout: Duration,
}

#[async_trait]
impl UsageSink for ChannelUsageSink {
    async fn report(&self, samples: Vec<UsageSample>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let count = samples.len();
        let mut stream = self.connection.open_stream().await?;
        let report = ChannelMessage::UsageReport {
            node_id: self.node_id.clone(),
            samples,
        };
        let reply = within(self.timeout, "UsageAck", stream.request(&report)).await?;

        match reply {
            ChannelMessage::UsageAck { accepted } => {
                debug!(sent = count, accepted, "Usage acknowledged by panel");
                Ok(())
            }
            other => Err(format!("expected UsageAck, got {}", other.kind()).into()),
        }
    }
}
