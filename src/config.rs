//! Command line and config file handling
//!
//! Every setting can come from a flag, a `SMITE_*` environment variable, or
//! the YAML config file. Flags and environment win over the file; anything
//! left unset falls back to its default.

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use smite_cert::{IdentityOptions, IdentityPaths};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CHANNEL_BIND: &str = "0.0.0.0:4443";
pub const DEFAULT_PANEL_API_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_NODE_API_BIND: &str = "127.0.0.1:8081";
pub const DEFAULT_SYSFS_NET_ROOT: &str = "/sys/class/net";

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub node: NodeFileConfig,

    #[serde(default)]
    pub panel: PanelFileConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodeFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panel_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panel_server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_bind: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sysfs_net_root: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PanelFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_bind: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_bind: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validity_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_threshold_days: Option<u32>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    info!("Loading configuration from: {}", path.display());

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

fn load_optional(path: Option<&Path>) -> Result<ConfigFile> {
    match path {
        Some(path) => load_config_file(path),
        None => Ok(ConfigFile::default()),
    }
}

#[derive(Args, Debug, Default)]
pub struct NodeArgs {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "SMITE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node identifier; must match the CN of the node certificate
    #[arg(long, env = "SMITE_NODE_ID")]
    pub node_id: Option<String>,

    /// Panel channel address (e.g., panel.example.com:4443)
    #[arg(long, env = "SMITE_PANEL_ADDR")]
    pub panel_addr: Option<String>,

    /// Name the panel certificate is checked against (defaults to the panel host)
    #[arg(long, env = "SMITE_PANEL_SERVER_NAME")]
    pub panel_server_name: Option<String>,

    /// Address of the node HTTP API
    #[arg(long, env = "SMITE_API_BIND")]
    pub api_bind: Option<SocketAddr>,

    /// Node certificate issued by the panel
    #[arg(long, env = "SMITE_CERT_PATH")]
    pub cert_path: Option<PathBuf>,

    /// Node private key
    #[arg(long, env = "SMITE_KEY_PATH")]
    pub key_path: Option<PathBuf>,

    /// Panel CA certificate
    #[arg(long, env = "SMITE_CA_PATH")]
    pub ca_path: Option<PathBuf>,

    /// Directory for tunnel configs and the registry snapshot
    #[arg(long, env = "SMITE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Seconds between usage reports
    #[arg(long, env = "SMITE_USAGE_INTERVAL_SECS")]
    pub usage_interval_secs: Option<u64>,

    /// Upper bound in seconds on a single adapter operation
    #[arg(long, env = "SMITE_OPERATION_TIMEOUT_SECS")]
    pub operation_timeout_secs: Option<u64>,

    /// Where interface counters are read from
    #[arg(long, env = "SMITE_SYSFS_NET_ROOT")]
    pub sysfs_net_root: Option<PathBuf>,
}

/// Fully resolved node settings
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    pub node_id: String,
    pub panel_addr: String,
    pub panel_server_name: Option<String>,
    pub api_bind: SocketAddr,
    pub identity: IdentityPaths,
    pub state_dir: PathBuf,
    pub usage_interval: Duration,
    pub operation_timeout: Duration,
    pub sysfs_net_root: PathBuf,
}

impl NodeSettings {
    pub fn load(args: NodeArgs) -> Result<Self> {
        let file = load_optional(args.config.as_deref())?;
        Self::merge(args, file.node)
    }

    /// Merge CLI args with the file section, giving precedence to CLI args
    pub fn merge(args: NodeArgs, file: NodeFileConfig) -> Result<Self> {
        let node_id = args
            .node_id
            .or(file.node_id)
            .filter(|id| !id.is_empty())
            .context("Node id is required (use --node-id, SMITE_NODE_ID or config file)")?;
        let panel_addr = args
            .panel_addr
            .or(file.panel_addr)
            .context("Panel address is required (use --panel-addr, SMITE_PANEL_ADDR or config file)")?;
        validate_address(&panel_addr, "panel")?;

        let default_identity = IdentityPaths::node_in("certs");
        let usage_interval_secs = args.usage_interval_secs.or(file.usage_interval_secs).unwrap_or(60);
        let operation_timeout_secs = args
            .operation_timeout_secs
            .or(file.operation_timeout_secs)
            .unwrap_or(30);
        if usage_interval_secs == 0 || operation_timeout_secs == 0 {
            anyhow::bail!("Intervals and timeouts must be at least one second");
        }

        Ok(Self {
            node_id,
            panel_addr,
            panel_server_name: args.panel_server_name.or(file.panel_server_name),
            api_bind: args.api_bind.or(file.api_bind).unwrap_or(default_addr(DEFAULT_NODE_API_BIND)?),
            identity: IdentityPaths {
                cert: args.cert_path.or(file.cert_path).unwrap_or(default_identity.cert),
                key: args.key_path.or(file.key_path).unwrap_or(default_identity.key),
                ca: args.ca_path.or(file.ca_path).unwrap_or(default_identity.ca),
            },
            state_dir: args.state_dir.or(file.state_dir).unwrap_or_else(|| PathBuf::from("state")),
            usage_interval: Duration::from_secs(usage_interval_secs),
            operation_timeout: Duration::from_secs(operation_timeout_secs),
            sysfs_net_root: args
                .sysfs_net_root
                .or(file.sysfs_net_root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSFS_NET_ROOT)),
        })
    }
}

#[derive(Args, Debug, Default)]
pub struct PanelArgs {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "SMITE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address nodes connect to
    #[arg(long, env = "SMITE_CHANNEL_BIND")]
    pub channel_bind: Option<SocketAddr>,

    /// Address of the operator HTTP API
    #[arg(long, env = "SMITE_API_BIND")]
    pub api_bind: Option<SocketAddr>,

    /// Directory holding the CA and the panel identity
    #[arg(long, env = "SMITE_CERT_DIR")]
    pub cert_dir: Option<PathBuf>,

    /// Name nodes use to reach the panel; becomes the panel certificate CN
    #[arg(long, env = "SMITE_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Upper bound in seconds on a request to a node
    #[arg(long, env = "SMITE_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// Validity of generated certificates in days
    #[arg(long, env = "SMITE_VALIDITY_DAYS")]
    pub validity_days: Option<u32>,

    /// Regenerate certificates this many days before expiry
    #[arg(long, env = "SMITE_RENEWAL_THRESHOLD_DAYS")]
    pub renewal_threshold_days: Option<u32>,
}

/// Fully resolved panel settings
#[derive(Debug, Clone, PartialEq)]
pub struct PanelSettings {
    pub channel_bind: SocketAddr,
    pub api_bind: SocketAddr,
    pub cert_dir: PathBuf,
    pub server_name: String,
    pub request_timeout: Duration,
    pub identity: IdentityOptions,
}

impl PanelSettings {
    pub fn load(args: PanelArgs) -> Result<Self> {
        let file = load_optional(args.config.as_deref())?;
        Self::merge(args, file.panel)
    }

    pub fn merge(args: PanelArgs, file: PanelFileConfig) -> Result<Self> {
        let defaults = IdentityOptions::default();
        let identity = IdentityOptions {
            validity_days: args
                .validity_days
                .or(file.validity_days)
                .unwrap_or(defaults.validity_days),
            renewal_threshold_days: args
                .renewal_threshold_days
                .or(file.renewal_threshold_days)
                .unwrap_or(defaults.renewal_threshold_days),
        };
        if identity.renewal_threshold_days >= identity.validity_days {
            anyhow::bail!(
                "Renewal threshold ({} days) must be shorter than validity ({} days)",
                identity.renewal_threshold_days,
                identity.validity_days
            );
        }

        let request_timeout_secs = args
            .request_timeout_secs
            .or(file.request_timeout_secs)
            .unwrap_or(30);
        if request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be at least one second");
        }

        Ok(Self {
            channel_bind: args
                .channel_bind
                .or(file.channel_bind)
                .unwrap_or(default_addr(DEFAULT_CHANNEL_BIND)?),
            api_bind: args
                .api_bind
                .or(file.api_bind)
                .unwrap_or(default_addr(DEFAULT_PANEL_API_BIND)?),
            cert_dir: args.cert_dir.or(file.cert_dir).unwrap_or_else(|| PathBuf::from("certs")),
            server_name: args
                .server_name
                .or(file.server_name)
                .unwrap_or_else(|| "localhost".to_string()),
            request_timeout: Duration::from_secs(request_timeout_secs),
            identity,
        })
    }
}

#[derive(Args, Debug)]
pub struct IssueNodeArgs {
    /// Node identifier; becomes the certificate CN
    #[arg(long, env = "SMITE_NODE_ID")]
    pub node_id: String,

    /// Directory holding the panel CA
    #[arg(long, env = "SMITE_CERT_DIR", default_value = "certs")]
    pub cert_dir: PathBuf,

    /// Where to write node.crt, node.key and ca.crt (defaults to ./<node-id>)
    #[arg(long, short = 'o')]
    pub out: Option<PathBuf>,

    /// Validity of the node certificate in days
    #[arg(long, env = "SMITE_VALIDITY_DAYS")]
    pub validity_days: Option<u32>,
}

fn default_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Invalid default address: {}", addr))
}

/// Validate address format (should be host:port)
pub fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let (host, port) = addr.rsplit_once(':').with_context(|| {
        format!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type, addr
        )
    })?;

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("panel.example.com:4443", "panel").is_ok());
        assert!(validate_address("[::1]:4443", "panel").is_ok());

        assert!(validate_address("panel.example.com", "panel").is_err());
        assert!(validate_address("panel.example.com:", "panel").is_err());
        assert!(validate_address("panel.example.com:abc", "panel").is_err());
        assert!(validate_address(":4443", "panel").is_err());
        assert!(validate_address("", "panel").is_err());
    }

    #[test]
    fn test_node_defaults() {
        let args = NodeArgs {
            node_id: Some("node-1".into()),
            panel_addr: Some("panel.example.com:4443".into()),
            ..Default::default()
        };
        let settings = NodeSettings::merge(args, NodeFileConfig::default()).unwrap();

        assert_eq!(settings.usage_interval, Duration::from_secs(60));
        assert_eq!(settings.operation_timeout, Duration::from_secs(30));
        assert_eq!(settings.sysfs_net_root, PathBuf::from("/sys/class/net"));
        assert_eq!(settings.identity, IdentityPaths::node_in("certs"));
        assert_eq!(settings.state_dir, PathBuf::from("state"));
        assert!(settings.panel_server_name.is_none());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
node:
  node_id: from-file
  panel_addr: file.example.com:4443
  usage_interval_secs: 120
  state_dir: /var/lib/smite
"#,
        )
        .unwrap();
        let args = NodeArgs {
            node_id: Some("from-cli".into()),
            ..Default::default()
        };
        let settings = NodeSettings::merge(args, file.node).unwrap();

        assert_eq!(settings.node_id, "from-cli");
        assert_eq!(settings.panel_addr, "file.example.com:4443");
        assert_eq!(settings.usage_interval, Duration::from_secs(120));
        assert_eq!(settings.state_dir, PathBuf::from("/var/lib/smite"));
    }

    #[test]
    fn test_node_requires_id_and_panel() {
        let missing_id = NodeArgs {
            panel_addr: Some("panel.example.com:4443".into()),
            ..Default::default()
        };
        assert!(NodeSettings::merge(missing_id, NodeFileConfig::default()).is_err());

        let bad_panel = NodeArgs {
            node_id: Some("node-1".into()),
            panel_addr: Some("panel.example.com".into()),
            ..Default::default()
        };
        assert!(NodeSettings::merge(bad_panel, NodeFileConfig::default()).is_err());
    }

    #[test]
    fn test_panel_defaults_and_validation() {
        let settings = PanelSettings::merge(PanelArgs::default(), PanelFileConfig::default()).unwrap();
        assert_eq!(settings.channel_bind, "0.0.0.0:4443".parse().unwrap());
        assert_eq!(settings.cert_dir, PathBuf::from("certs"));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.identity.validity_days, 365);
        assert_eq!(settings.identity.renewal_threshold_days, 30);

        let args = PanelArgs {
            validity_days: Some(10),
            renewal_threshold_days: Some(30),
            ..Default::default()
        };
        assert!(PanelSettings::merge(args, PanelFileConfig::default()).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("smite.yaml");
        fs::write(
            &path,
            "panel:\n  channel_bind: 127.0.0.1:5555\n  request_timeout_secs: 5\n",
        )
        .unwrap();

        let settings = PanelSettings::load(PanelArgs {
            config: Some(path),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(settings.channel_bind, "127.0.0.1:5555".parse().unwrap());
        assert_eq!(settings.request_timeout, Duration::from_secs(5));

        assert!(load_config_file(&dir.path().join("missing.yaml")).is_err());
    }
}
