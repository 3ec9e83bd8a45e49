//! Smite - panel and node for managed tunnels
//!
//! The panel drives tunnels on its nodes over a mutually authenticated QUIC
//! channel; each node applies them locally and reports usage back.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{IssueNodeArgs, NodeArgs, NodeSettings, PanelArgs, PanelSettings};
use smite_agent::{Agent, AgentConfig};
use smite_cert::{CertificateAuthority, IdentityOptions};
use smite_control::{AdapterManager, AdapterSet, AdapterSettings, TunnelRegistry, UsageCollector};
use smite_panel::{Panel, PanelServer};
use smite_transport_quic::SecureChannelManager;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Smite - manage tunnels on remote nodes from a central panel
#[derive(Parser, Debug)]
#[command(name = "smite")]
#[command(about = "Smite - manage tunnels on remote nodes from a central panel")]
#[command(version)]
#[command(long_version = concat!(
    env!("SMITE_RELEASE"),
    " (", env!("SMITE_COMMIT"), ", built ", env!("SMITE_BUILD_DATE"), ")"
))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "SMITE_LOG_LEVEL")]
    log_level: String,

    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a node: apply tunnels requested by the panel and report usage
    #[command(long_about = r#"
Run a node. The node dials the panel over the secure channel using the
certificate the panel issued for it, applies the tunnels the panel asks for,
and reports usage of Active tunnels upstream. A local HTTP API exposes the
same operations.

EXAMPLES:
  # Join a panel with certificates from `smite issue-node`
  smite node --node-id node-1 --panel-addr panel.example.com:4443 \
    --cert-path node-1/node.crt --key-path node-1/node.key --ca-path node-1/ca.crt

  # Use a config file
  smite node --config node.yaml

ENVIRONMENT VARIABLES:
  SMITE_NODE_ID      Node identifier (certificate CN)
  SMITE_PANEL_ADDR   Panel channel address
  SMITE_STATE_DIR    Tunnel configs and registry snapshot
"#)]
    Node(NodeArgs),

    /// Run the panel: accept nodes and serve the operator API
    #[command(long_about = r#"
Run the panel. On first start the panel creates its CA and its own
certificate in the cert directory; both are regenerated when they get close
to expiry.

EXAMPLES:
  smite panel --server-name panel.example.com --cert-dir /etc/smite/certs

ENVIRONMENT VARIABLES:
  SMITE_CHANNEL_BIND  Address nodes connect to (default 0.0.0.0:4443)
  SMITE_API_BIND      Operator API address (default 127.0.0.1:8080)
  SMITE_CERT_DIR      CA and panel identity directory
"#)]
    Panel(PanelArgs),

    /// Issue a node certificate from the panel CA
    IssueNode(IssueNodeArgs),
}

/// Setup logging; `RUST_LOG` wins over the flags
fn setup_logging(log_level: &str, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { log_level };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let settings = NodeSettings::load(args).context("Failed to build node configuration")?;

    info!("Node ID: {}", settings.node_id);
    info!("Panel: {}", settings.panel_addr);
    info!("State directory: {}", settings.state_dir.display());

    let registry = TunnelRegistry::with_snapshot(&settings.state_dir)
        .with_context(|| format!("Failed to open registry in {}", settings.state_dir.display()))?;
    let adapters = AdapterSet::standard(&AdapterSettings {
        state_dir: settings.state_dir.clone(),
        sysfs_net_root: settings.sysfs_net_root.clone(),
    });
    let manager = AdapterManager::new(registry, adapters).with_operation_timeout(settings.operation_timeout);

    let report = manager.restore().await;
    info!(
        reapplied = report.reapplied.len(),
        failed = report.failed.len(),
        removed = report.removed.len(),
        "Registry restored"
    );
    for tunnel_id in &report.failed {
        warn!(tunnel_id = %tunnel_id, "Tunnel could not be restored");
    }

    let collector = UsageCollector::new(manager.clone());

    let channel = SecureChannelManager::from_files(&settings.identity)
        .context("Failed to load node identity")?;
    let mut agent_config = AgentConfig::new(settings.node_id.clone(), settings.panel_addr.clone());
    if let Some(server_name) = settings.panel_server_name {
        agent_config.panel_server_name = server_name;
    }
    agent_config.usage_interval = settings.usage_interval;
    agent_config.request_timeout = settings.operation_timeout;

    let agent = Agent::new(agent_config, channel, manager.clone(), collector.clone())
        .context("Failed to create agent")?;
    let router = smite_api::node_router(manager, collector);

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = agent.run() => {
            if let Err(e) = result {
                error!("Agent error: {}", e);
                return Err(e.into());
            }
            info!("Agent stopped normally");
        }
        result = smite_api::serve(settings.api_bind, router) => {
            result.context("Node API failed")?;
        }
    }

    info!("Node stopped");
    Ok(())
}

async fn run_panel(args: PanelArgs) -> Result<()> {
    let settings = PanelSettings::load(args).context("Failed to build panel configuration")?;

    let channel = SecureChannelManager::bootstrap_panel(&settings.cert_dir, &settings.server_name, settings.identity)
        .with_context(|| format!("Failed to prepare panel identity in {}", settings.cert_dir.display()))?;
    let listener = channel
        .listen(settings.channel_bind)
        .with_context(|| format!("Failed to bind channel on {}", settings.channel_bind))?;

    let panel = Panel::new().with_request_timeout(settings.request_timeout);
    let server = PanelServer::new(listener, &panel);
    let router = smite_api::panel_router(panel);

    info!("Channel: {}", settings.channel_bind);
    info!("Operator API: {}", settings.api_bind);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            server.close();
        }
        result = server.run() => {
            result.context("Panel channel failed")?;
        }
        result = smite_api::serve(settings.api_bind, router) => {
            result.context("Panel API failed")?;
        }
    }

    info!("Panel stopped");
    Ok(())
}

fn issue_node(args: IssueNodeArgs) -> Result<()> {
    let mut options = IdentityOptions::default();
    if let Some(days) = args.validity_days {
        options.validity_days = days;
    }
    // A running panel keeps trusting the CA it started with, so renewing
    // here would hand out certificates it rejects
    let authority = CertificateAuthority::open(&args.cert_dir, options).with_context(|| {
        format!(
            "Cannot issue from {} (start `smite panel` once to create the CA, or restart it to renew one)",
            args.cert_dir.display()
        )
    })?;

    let bundle = authority
        .issue_node_certificate(&args.node_id)
        .with_context(|| format!("Failed to issue certificate for {}", args.node_id))?;
    let out = args.out.unwrap_or_else(|| PathBuf::from(&args.node_id));
    let paths = bundle
        .write_to(&out)
        .with_context(|| format!("Failed to write node identity to {}", out.display()))?;

    info!(
        node_id = %bundle.subject,
        not_after = %bundle.not_after,
        "Node certificate issued"
    );
    info!("Certificate: {}", paths.cert.display());
    info!("Key: {}", paths.key.display());
    info!("CA: {}", paths.ca.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging first
    setup_logging(&cli.log_level, cli.verbose)?;

    match cli.command {
        Commands::Node(args) => {
            info!("Smite node starting...");
            run_node(args).await
        }
        Commands::Panel(args) => {
            info!("Smite panel starting...");
            run_panel(args).await
        }
        Commands::IssueNode(args) => issue_node(args),
    }
}
