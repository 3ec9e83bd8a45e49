//! Secure channel configuration

use crate::error::{ChannelError, ChannelResult};
use quinn::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use quinn::rustls::RootCertStore;
use smite_cert::{Identity, IdentityPaths};
use smite_proto::ALPN_PROTOCOL;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Mutual TLS channel configuration
///
/// Both sides present a leaf certificate and trust only the CA at `ca_path`.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Own leaf certificate (PEM)
    pub cert_path: PathBuf,

    /// Own private key (PEM)
    pub key_path: PathBuf,

    /// CA certificate the peer must chain to (PEM)
    pub ca_path: PathBuf,

    pub alpn_protocols: Vec<String>,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Upper bound on the TLS handshake
    pub handshake_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams
    pub max_concurrent_streams: u64,
}

impl ChannelConfig {
    pub fn new(paths: &IdentityPaths) -> Self {
        Self {
            cert_path: paths.cert.clone(),
            key_path: paths.key.clone(),
            ca_path: paths.ca.clone(),
            alpn_protocols: vec![ALPN_PROTOCOL.to_string()],
            keep_alive_interval: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_concurrent_streams: 256,
        }
    }

    pub fn from_identity(identity: &Identity) -> Self {
        Self::new(&identity.paths)
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set maximum concurrent streams
    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn validate(&self) -> ChannelResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(ChannelError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(ChannelError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        if self.handshake_timeout.is_zero() {
            return Err(ChannelError::ConfigurationError(
                "Handshake timeout must be > 0".to_string(),
            ));
        }

        if self.alpn_protocols.is_empty() {
            return Err(ChannelError::ConfigurationError(
                "At least one ALPN protocol is required".to_string(),
            ));
        }

        Ok(())
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }

    fn transport(&self) -> ChannelResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.max_idle_timeout)
            .map_err(|e| ChannelError::ConfigurationError(format!("Idle timeout: {}", e)))?;
        let streams = quinn::VarInt::from_u64(self.max_concurrent_streams)
            .map_err(|e| ChannelError::ConfigurationError(format!("Max streams: {}", e)))?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(streams);
        Ok(transport)
    }

    /// Build quinn ClientConfig presenting our certificate to the server
    pub(crate) fn build_client_config(&self) -> ChannelResult<quinn::ClientConfig> {
        ensure_crypto_provider();

        let roots = load_roots(&self.ca_path)?;
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let mut client_crypto = quinn::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| ChannelError::TlsError(format!("Invalid cert/key: {}", e)))?;
        client_crypto.alpn_protocols = self.alpn();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| ChannelError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(self.transport()?));

        Ok(client_config)
    }

    /// Build quinn ServerConfig requiring a CA-signed client certificate
    pub(crate) fn build_server_config(&self) -> ChannelResult<quinn::ServerConfig> {
        ensure_crypto_provider();

        let roots = load_roots(&self.ca_path)?;
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let verifier = quinn::rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ChannelError::TlsError(format!("Client verifier: {}", e)))?;

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| ChannelError::TlsError(format!("Invalid cert/key: {}", e)))?;
        server_crypto.alpn_protocols = self.alpn();

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| ChannelError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(self.transport()?));

        Ok(server_config)
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Helper functions for loading certificates

fn load_certs(path: &Path) -> ChannelResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ChannelError::TlsError(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ChannelError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(ChannelError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> ChannelResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ChannelError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ChannelError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| ChannelError::TlsError("No private key found".to_string()))
}

fn load_roots(path: &Path) -> ChannelResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ChannelError::ConfigurationError(format!("Invalid root cert: {}", e)))?;
    }
    Ok(roots)
}
