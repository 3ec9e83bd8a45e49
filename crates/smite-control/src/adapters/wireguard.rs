//! WireGuard adapter
//!
//! Renders a wg-quick style configuration per tunnel and meters traffic from
//! the kernel interface counters. Bringing the interface up is left to the
//! host (a `wg-quick@` unit watching the config directory).

use super::{delete_config, optional_str, optional_u64, require_host_port, write_config};
use crate::adapter::{AdapterError, BackendStatus, TunnelAdapter};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use smite_proto::{TunnelSpec, TunnelType};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Linux limit on network interface names
const MAX_INTERFACE_LEN: usize = 15;

const DEFAULT_ALLOWED_IPS: &str = "0.0.0.0/0";

#[derive(Debug)]
pub struct WireguardAdapter {
    config_dir: PathBuf,
    sysfs_net_root: PathBuf,
}

impl WireguardAdapter {
    pub fn new(config_dir: impl Into<PathBuf>, sysfs_net_root: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            sysfs_net_root: sysfs_net_root.into(),
        }
    }

    /// Interface name for a tunnel: its `interface` field, else `wg-<id>`
    ///
    /// Ids too long for `wg-<id>` get `wg` plus a digest of the whole id, so
    /// distinct ids never share an interface.
    pub fn interface_name(tunnel_id: &str, spec: &TunnelSpec) -> String {
        if let Some(name) = spec.get_str("interface") {
            return name.to_string();
        }
        let readable = format!("wg-{}", tunnel_id);
        if readable.len() <= MAX_INTERFACE_LEN {
            return readable;
        }
        let digest = format!("{:x}", Sha256::digest(tunnel_id.as_bytes()));
        format!("wg{}", &digest[..MAX_INTERFACE_LEN - 2])
    }

    pub fn config_path(&self, tunnel_id: &str, spec: &TunnelSpec) -> PathBuf {
        self.config_dir
            .join(format!("{}.conf", Self::interface_name(tunnel_id, spec)))
    }

    fn allowed_ips(spec: &TunnelSpec) -> Result<String, String> {
        match spec.get("allowed_ips") {
            None => Ok(DEFAULT_ALLOWED_IPS.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Array(items)) => {
                let ranges = items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .ok_or_else(|| "'allowed_ips' entries must be strings".to_string())
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if ranges.is_empty() {
                    return Err("'allowed_ips' must not be empty".to_string());
                }
                Ok(ranges.join(", "))
            }
            Some(_) => Err("'allowed_ips' must be a string or a list of strings".to_string()),
        }
    }

    /// Render the configuration file for a validated spec
    pub fn render(tunnel_id: &str, spec: &TunnelSpec) -> Result<String, String> {
        let endpoint = require_host_port(spec, "endpoint")?;
        let allowed_ips = Self::allowed_ips(spec)?;

        let mut out = String::new();
        let _ = writeln!(out, "# Managed by smite for tunnel {}", tunnel_id);
        out.push_str("[Interface]\n");
        if let Some(key) = optional_str(spec, "private_key")? {
            let _ = writeln!(out, "PrivateKey = {}", key);
        }
        if let Some(address) = optional_str(spec, "address")? {
            let _ = writeln!(out, "Address = {}", address);
        }
        if let Some(port) = optional_u64(spec, "listen_port")? {
            let _ = writeln!(out, "ListenPort = {}", port);
        }

        out.push_str("\n[Peer]\n");
        if let Some(key) = optional_str(spec, "public_key")? {
            let _ = writeln!(out, "PublicKey = {}", key);
        }
        let _ = writeln!(out, "Endpoint = {}", endpoint);
        let _ = writeln!(out, "AllowedIPs = {}", allowed_ips);
        if let Some(keepalive) = optional_u64(spec, "persistent_keepalive")? {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }
        Ok(out)
    }

    fn statistics_dir(&self, interface: &str) -> PathBuf {
        self.sysfs_net_root.join(interface).join("statistics")
    }
}

async fn read_counter(path: &Path) -> Result<u64, AdapterError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AdapterError::io(format!("read {}", path.display()), e))?;
    text.trim()
        .parse()
        .map_err(|_| AdapterError::Backend(format!("{} is not a counter", path.display())))
}

#[async_trait]
impl TunnelAdapter for WireguardAdapter {
    fn tunnel_type(&self) -> TunnelType {
        TunnelType::Wireguard
    }

    fn backend_key(&self, tunnel_id: &str, spec: &TunnelSpec) -> Option<String> {
        Some(Self::interface_name(tunnel_id, spec))
    }

    fn validate(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<(), String> {
        if let Some(port) = optional_u64(spec, "listen_port")? {
            if port == 0 || port > u64::from(u16::MAX) {
                return Err("'listen_port' must be between 1 and 65535".to_string());
            }
        }
        if let Some(name) = optional_str(spec, "interface")? {
            if name.is_empty()
                || name.len() > MAX_INTERFACE_LEN
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            {
                return Err(format!("'interface' {} is not a valid interface name", name));
            }
        }
        Self::render(tunnel_id, spec).map(|_| ())
    }

    async fn apply(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<(), AdapterError> {
        let config = Self::render(tunnel_id, spec).map_err(AdapterError::Backend)?;
        let path = self.config_path(tunnel_id, spec);
        write_config(&path, config, true).await?;

        info!(
            tunnel_id,
            interface = %Self::interface_name(tunnel_id, spec),
            path = %path.display(),
            "WireGuard config written"
        );
        Ok(())
    }

    async fn remove(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<(), AdapterError> {
        let path = self.config_path(tunnel_id, spec);
        let existed = delete_config(&path).await?;
        debug!(tunnel_id, path = %path.display(), existed, "WireGuard config removed");
        Ok(())
    }

    async fn status(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<BackendStatus, AdapterError> {
        let present = tokio::fs::try_exists(self.config_path(tunnel_id, spec))
            .await
            .unwrap_or(false);
        let interface = Self::interface_name(tunnel_id, spec);
        let running = tokio::fs::try_exists(self.sysfs_net_root.join(&interface))
            .await
            .unwrap_or(false);

        Ok(BackendStatus {
            present,
            running,
            detail: (!running).then(|| format!("interface {} is not up", interface)),
        })
    }

    fn supports_usage(&self) -> bool {
        true
    }

    async fn usage(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<u64, AdapterError> {
        let interface = Self::interface_name(tunnel_id, spec);
        let stats = self.statistics_dir(&interface);
        if !tokio::fs::try_exists(&stats).await.unwrap_or(false) {
            return Err(AdapterError::Unsupported);
        }

        let rx = read_counter(&stats.join("rx_bytes")).await?;
        let tx = read_counter(&stats.join("tx_bytes")).await?;
        Ok(rx.saturating_add(tx))
    }
}
