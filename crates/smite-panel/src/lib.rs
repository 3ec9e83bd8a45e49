//! Smite panel
//!
//! The panel is the control side of the secure channel. Nodes dial in and
//! identify themselves with a certificate issued by the panel's CA; the
//! panel then drives tunnels on them and collects their usage reports.
//!
//! # Example
//!
//! ```no_run
//! use smite_cert::IdentityOptions;
//! use smite_panel::{Panel, PanelServer};
//! use smite_transport_quic::SecureChannelManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = SecureChannelManager::bootstrap_panel("certs", "panel.example.com", IdentityOptions::default())?;
//! let panel = Panel::new();
//! let server = PanelServer::new(channel.listen("0.0.0.0:4443".parse()?)?, &panel);
//! tokio::spawn(async move { server.run().await });
//!
//! for node in panel.list_nodes() {
//!     let rtt = panel.ping(&node.node_id).await?;
//!     println!("{} {:?}", node.node_id, rtt);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod ledger;
pub mod nodes;
pub mod panel;
pub mod server;

pub use error::PanelError;
pub use ledger::{NodeUsage, UsageLedger};
pub use nodes::{ConnectedNode, NodeInfo, NodeRegistry};
pub use panel::{Panel, TunnelReply, DEFAULT_REQUEST_TIMEOUT};
pub use server::{PanelServer, DEFAULT_HELLO_TIMEOUT};
