//! Secure channel manager: identity ownership plus channel setup

use crate::config::ChannelConfig;
use crate::connection::ChannelConnection;
use crate::error::ChannelResult;
use crate::listener::{ChannelConnector, ChannelListener};
use smite_cert::{CertificateAuthority, Identity, IdentityOptions, IdentityPaths};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

enum Role {
    /// Holds the CA and can mint or rotate its own identity
    Panel {
        authority: Arc<CertificateAuthority>,
        subject: String,
    },
    /// Uses an identity issued by the panel
    Node { paths: IdentityPaths },
}

/// Owns the local identity and establishes authenticated channels with it
pub struct SecureChannelManager {
    role: Role,
    config: ChannelConfig,
}

impl std::fmt::Debug for SecureChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannelManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SecureChannelManager {
    /// Panel side: load or create the CA in `cert_dir` and issue the panel's
    /// own leaf identity from it
    pub fn bootstrap_panel(
        cert_dir: impl AsRef<Path>,
        subject: &str,
        options: IdentityOptions,
    ) -> ChannelResult<Self> {
        let authority = Arc::new(CertificateAuthority::ensure(cert_dir, options)?);
        let identity = authority.ensure_identity(subject)?;

        info!(
            subject,
            ca = %authority.cert_path().display(),
            not_after = %identity.info.not_after,
            regenerated = identity.regenerated,
            "Panel identity ready"
        );

        Ok(Self {
            config: ChannelConfig::from_identity(&identity),
            role: Role::Panel {
                authority,
                subject: subject.to_string(),
            },
        })
    }

    /// Node side: use the certificate bundle the panel issued for this node
    pub fn from_files(paths: &IdentityPaths) -> ChannelResult<Self> {
        let identity = Identity::load(paths)?;

        info!(
            subject = %identity.info.subject_cn,
            not_after = %identity.info.not_after,
            "Node identity loaded"
        );

        Ok(Self {
            config: ChannelConfig::from_identity(&identity),
            role: Role::Node {
                paths: identity.paths,
            },
        })
    }

    /// Adjust channel parameters (timeouts, keep-alive)
    pub fn configure(mut self, f: impl FnOnce(ChannelConfig) -> ChannelConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The panel CA, when this manager runs on the panel
    pub fn authority(&self) -> Option<&Arc<CertificateAuthority>> {
        match &self.role {
            Role::Panel { authority, .. } => Some(authority),
            Role::Node { .. } => None,
        }
    }

    /// Return a valid identity, rotating the panel's leaf when it is missing,
    /// corrupt, or close to expiry
    ///
    /// A node cannot rotate on its own; an expired node identity is an error.
    pub fn ensure_identity(&self) -> ChannelResult<Identity> {
        let identity = match &self.role {
            Role::Panel { authority, subject } => authority.ensure_identity(subject)?,
            Role::Node { paths } => Identity::load(paths)?,
        };
        if identity.regenerated {
            warn!(subject = %identity.info.subject_cn, "Identity rotated");
        }
        Ok(identity)
    }

    /// Establish a mutually authenticated channel to `peer`
    pub async fn open_channel(
        &self,
        peer: SocketAddr,
        server_name: &str,
    ) -> ChannelResult<ChannelConnection> {
        self.ensure_identity()?;
        let connector = ChannelConnector::for_peer(&self.config, peer)?;
        connector.connect(peer, server_name).await
    }

    /// Start accepting channels on `bind_addr`
    pub fn listen(&self, bind_addr: SocketAddr) -> ChannelResult<ChannelListener> {
        self.ensure_identity()?;
        ChannelListener::bind(bind_addr, &self.config)
    }
}
