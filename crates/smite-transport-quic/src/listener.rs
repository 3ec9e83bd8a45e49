//! Channel listener and connector

use crate::config::ChannelConfig;
use crate::connection::ChannelConnection;
use crate::error::{from_connection_error, ChannelError, ChannelResult};
use quinn::Endpoint;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Accepts mutually authenticated channel connections
#[derive(Debug)]
pub struct ChannelListener {
    endpoint: Endpoint,
    handshake_timeout: Duration,
}

impl ChannelListener {
    pub fn bind(bind_addr: SocketAddr, config: &ChannelConfig) -> ChannelResult<Self> {
        config.validate()?;

        let server_config = config.build_server_config()?;
        let endpoint = Endpoint::server(server_config, bind_addr)?;
        let local_addr = endpoint.local_addr()?;

        info!(%local_addr, "Secure channel listener bound");

        Ok(Self {
            endpoint,
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// Wait for the next connection that completes the handshake
    ///
    /// Handshakes that fail or exceed the handshake timeout are logged and
    /// skipped; only endpoint shutdown ends the loop.
    pub async fn accept(&self) -> ChannelResult<(ChannelConnection, SocketAddr)> {
        loop {
            let Some(incoming) = self.endpoint.accept().await else {
                return Err(ChannelError::ConnectionError(
                    "Channel endpoint closed".to_string(),
                ));
            };
            let remote = incoming.remote_address();
            debug!(%remote, "Incoming channel connection");

            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    warn!(%remote, error = %e, "Refused incoming connection");
                    continue;
                }
            };

            match tokio::time::timeout(self.handshake_timeout, connecting).await {
                Ok(Ok(connection)) => {
                    info!(%remote, "Channel connection established");
                    return Ok((ChannelConnection::new(connection), remote));
                }
                Ok(Err(e)) => {
                    warn!(%remote, error = %from_connection_error(e), "Channel handshake failed");
                }
                Err(_) => {
                    warn!(%remote, "Channel handshake timed out");
                }
            }
        }
    }

    pub fn local_addr(&self) -> ChannelResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"Listener closed");
        info!("Secure channel listener closed");
    }
}

/// Dials mutually authenticated channel connections
#[derive(Debug)]
pub struct ChannelConnector {
    endpoint: Endpoint,
    handshake_timeout: Duration,
}

impl ChannelConnector {
    pub fn new(config: &ChannelConfig) -> ChannelResult<Self> {
        Self::for_family(config, false)
    }

    /// Connector bound to the address family of `peer`
    pub fn for_peer(config: &ChannelConfig, peer: SocketAddr) -> ChannelResult<Self> {
        Self::for_family(config, peer.is_ipv6())
    }

    fn for_family(config: &ChannelConfig, ipv6: bool) -> ChannelResult<Self> {
        config.validate()?;

        let client_config = config.build_client_config()?;
        let bind: SocketAddr = if ipv6 {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };

        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);

        debug!("Secure channel connector created");

        Ok(Self {
            endpoint,
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// Connect and complete the mutual TLS handshake within the handshake timeout
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> ChannelResult<ChannelConnection> {
        debug!(%addr, server_name, "Connecting secure channel");

        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| ChannelError::ConnectionError(e.to_string()))?;

        let connection = tokio::time::timeout(self.handshake_timeout, connecting)
            .await
            .map_err(|_| ChannelError::HandshakeTimeout(addr))?
            .map_err(from_connection_error)?;

        info!(%addr, server_name, "Secure channel established");
        Ok(ChannelConnection::new(connection))
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"Connector closed");
    }
}
