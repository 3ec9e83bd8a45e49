//! Tunnel adapters: one backend per supported tunnel technology

use crate::adapters::{Hysteria2Adapter, TcpAdapter, WireguardAdapter};
use crate::error::TunnelError;
use async_trait::async_trait;
use smite_proto::{TunnelSpec, TunnelType, UnknownTunnelType};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Adapter-level failures
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Operation not supported by this adapter")]
    Unsupported,
}

impl AdapterError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AdapterError::Io {
            context: context.into(),
            source,
        }
    }
}

/// What the backend reports about a tunnel
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackendStatus {
    /// Whether the backend artefact (config file, forwarder task) is in place
    pub present: bool,
    /// Whether traffic can currently flow
    pub running: bool,
    pub detail: Option<String>,
}

/// Capability set of a tunnel backend
///
/// Adapters are driven only by `AdapterManager`, which serializes calls per
/// tunnel, so implementations need no per-tunnel locking of their own.
/// `apply` must replace any configuration previously applied for the same
/// tunnel id.
#[async_trait]
pub trait TunnelAdapter: Send + Sync + fmt::Debug {
    fn tunnel_type(&self) -> TunnelType;

    /// Check a tunnel spec before any state changes; returns the reason on failure
    fn validate(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<(), String>;

    /// Host resource the tunnel would own exclusively, if any
    ///
    /// Two live tunnels of the same type must never share a key.
    fn backend_key(&self, _tunnel_id: &str, _spec: &TunnelSpec) -> Option<String> {
        None
    }

    async fn apply(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<(), AdapterError>;

    async fn remove(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<(), AdapterError>;

    async fn status(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<BackendStatus, AdapterError>;

    /// Whether `usage` can ever succeed for this adapter
    fn supports_usage(&self) -> bool {
        false
    }

    /// Bytes carried by the tunnel since it was last applied
    async fn usage(&self, _tunnel_id: &str, _spec: &TunnelSpec) -> Result<u64, AdapterError> {
        Err(AdapterError::Unsupported)
    }
}

/// Where adapters keep their artefacts
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Root for rendered configuration files
    pub state_dir: PathBuf,
    /// Linux network interface statistics root
    pub sysfs_net_root: PathBuf,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            sysfs_net_root: PathBuf::from("/sys/class/net"),
        }
    }
}

/// Closed mapping from tunnel type to its adapter
#[derive(Debug, Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<TunnelType, Arc<dyn TunnelAdapter>>,
}

impl AdapterSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every supported tunnel technology
    pub fn standard(settings: &AdapterSettings) -> Self {
        Self::empty()
            .with(WireguardAdapter::new(
                settings.state_dir.join("wireguard"),
                settings.sysfs_net_root.clone(),
            ))
            .with(Hysteria2Adapter::new(settings.state_dir.join("hysteria2")))
            .with(TcpAdapter::new())
    }

    /// Register an adapter under its own tunnel type
    pub fn with(mut self, adapter: impl TunnelAdapter + 'static) -> Self {
        self.adapters.insert(adapter.tunnel_type(), Arc::new(adapter));
        self
    }

    pub fn get(&self, tunnel_type: TunnelType) -> Option<Arc<dyn TunnelAdapter>> {
        self.adapters.get(&tunnel_type).cloned()
    }

    /// Resolve an untrusted type string to a registered adapter
    pub fn resolve(
        &self,
        tunnel_type: &str,
    ) -> Result<(TunnelType, Arc<dyn TunnelAdapter>), TunnelError> {
        let parsed: TunnelType = tunnel_type
            .parse()
            .map_err(|UnknownTunnelType(name)| TunnelError::UnsupportedTunnelType(name))?;
        let adapter = self
            .get(parsed)
            .ok_or_else(|| TunnelError::UnsupportedTunnelType(tunnel_type.to_string()))?;
        Ok((parsed, adapter))
    }

    pub fn types(&self) -> Vec<TunnelType> {
        let mut types: Vec<_> = self.adapters.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_set_covers_all_types() {
        let set = AdapterSet::standard(&AdapterSettings::default());
        for ty in TunnelType::ALL {
            assert!(set.get(ty).is_some(), "missing adapter for {}", ty);
        }
    }

    #[test]
    fn test_resolve_rejects_unknown_and_unregistered() {
        let set = AdapterSet::empty().with(TcpAdapter::new());

        assert!(matches!(
            set.resolve("bogus"),
            Err(TunnelError::UnsupportedTunnelType(t)) if t == "bogus"
        ));
        assert!(matches!(
            set.resolve("wireguard"),
            Err(TunnelError::UnsupportedTunnelType(_))
        ));
        assert_eq!(set.resolve("tcp").unwrap().0, TunnelType::Tcp);
        assert!(matches!(
            set.resolve("TCP"),
            Err(TunnelError::UnsupportedTunnelType(t)) if t == "TCP"
        ));
    }
}
