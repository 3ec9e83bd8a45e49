//! Hysteria2 adapter: one client configuration file per tunnel

use super::{delete_config, optional_bool, optional_str, require_host_port, require_str, write_config};
use crate::adapter::{AdapterError, BackendStatus, TunnelAdapter};
use async_trait::async_trait;
use serde::Serialize;
use smite_proto::{TunnelSpec, TunnelType};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct ClientConfig<'a> {
    server: &'a str,
    auth: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bandwidth: Option<Bandwidth<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<Tls<'a>>,
}

#[derive(Debug, Serialize)]
struct Bandwidth<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    up: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    down: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Tls<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    sni: Option<&'a str>,
    insecure: bool,
}

#[derive(Debug)]
pub struct Hysteria2Adapter {
    config_dir: PathBuf,
}

impl Hysteria2Adapter {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_path(&self, tunnel_id: &str) -> PathBuf {
        self.config_dir.join(format!("{}.yaml", tunnel_id))
    }

    /// Render the client configuration for a validated spec
    pub fn render(spec: &TunnelSpec) -> Result<String, String> {
        let server = require_host_port(spec, "server")?;
        let auth = require_str(spec, "auth")?;
        let up = optional_str(spec, "bandwidth_up")?;
        let down = optional_str(spec, "bandwidth_down")?;
        let sni = optional_str(spec, "sni")?;
        let insecure = optional_bool(spec, "insecure")?;

        let config = ClientConfig {
            server,
            auth,
            bandwidth: (up.is_some() || down.is_some()).then_some(Bandwidth { up, down }),
            tls: (sni.is_some() || insecure.is_some()).then(|| Tls {
                sni,
                insecure: insecure.unwrap_or(false),
            }),
        };
        serde_yaml::to_string(&config).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl TunnelAdapter for Hysteria2Adapter {
    fn tunnel_type(&self) -> TunnelType {
        TunnelType::Hysteria2
    }

    fn validate(&self, _tunnel_id: &str, spec: &TunnelSpec) -> Result<(), String> {
        Self::render(spec).map(|_| ())
    }

    async fn apply(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<(), AdapterError> {
        let config = Self::render(spec).map_err(AdapterError::Backend)?;
        let path = self.config_path(tunnel_id);
        write_config(&path, config, true).await?;

        info!(tunnel_id, path = %path.display(), "Hysteria2 config written");
        Ok(())
    }

    async fn remove(&self, tunnel_id: &str, _spec: &TunnelSpec) -> Result<(), AdapterError> {
        let path = self.config_path(tunnel_id);
        let existed = delete_config(&path).await?;
        debug!(tunnel_id, path = %path.display(), existed, "Hysteria2 config removed");
        Ok(())
    }

    async fn status(&self, tunnel_id: &str, _spec: &TunnelSpec) -> Result<BackendStatus, AdapterError> {
        let present = tokio::fs::try_exists(self.config_path(tunnel_id))
            .await
            .unwrap_or(false);
        Ok(BackendStatus {
            present,
            running: present,
            detail: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn spec(value: serde_json::Value) -> TunnelSpec {
        TunnelSpec::try_from(value).unwrap()
    }

    #[test]
    fn test_validate_requires_server_and_auth() {
        let hy = Hysteria2Adapter::new("unused");

        assert!(hy
            .validate("t1", &spec(json!({"server": "hy.example.com:443", "auth": "secret"})))
            .is_ok());
        assert!(hy.validate("t1", &spec(json!({"auth": "secret"}))).is_err());
        assert!(hy.validate("t1", &spec(json!({"server": "hy.example.com:443"}))).is_err());
        assert!(hy
            .validate("t1", &spec(json!({"server": "hy.example.com:443", "auth": "x", "insecure": "yes"})))
            .is_err());
    }

    #[test]
    fn test_render_is_yaml() {
        let rendered = Hysteria2Adapter::render(&spec(json!({
            "server": "hy.example.com:443",
            "auth": "secret",
            "bandwidth_up": "50 mbps",
            "sni": "cdn.example.com"
        })))
        .unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["server"].as_str(), Some("hy.example.com:443"));
        assert_eq!(parsed["auth"].as_str(), Some("secret"));
        assert_eq!(parsed["bandwidth"]["up"].as_str(), Some("50 mbps"));
        assert!(parsed["bandwidth"].get("down").is_none());
        assert_eq!(parsed["tls"]["sni"].as_str(), Some("cdn.example.com"));
        assert_eq!(parsed["tls"]["insecure"].as_bool(), Some(false));
    }

    #[tokio::test]
    async fn test_lifecycle_and_no_usage() {
        let dir = TempDir::new().unwrap();
        let hy = Hysteria2Adapter::new(dir.path());
        let s = spec(json!({"server": "hy.example.com:443", "auth": "secret"}));

        hy.apply("t1", &s).await.unwrap();
        assert!(hy.status("t1", &s).await.unwrap().present);
        assert!(!hy.supports_usage());
        assert!(matches!(hy.usage("t1", &s).await, Err(AdapterError::Unsupported)));

        hy.remove("t1", &s).await.unwrap();
        assert!(!hy.config_path("t1").exists());
    }
}
