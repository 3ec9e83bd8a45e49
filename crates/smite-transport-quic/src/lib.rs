//! QUIC secure channel between the panel and its nodes
//!
//! Every connection is mutual TLS 1.3 over QUIC: the panel presents its leaf
//! certificate, each node presents the leaf the panel issued for it, and both
//! sides trust only the panel CA. Messages travel as length-prefixed
//! `ChannelMessage` frames, one request/reply exchange per stream.
//!
//! # Example
//!
//! ```no_run
//! use smite_cert::{IdentityOptions, IdentityPaths};
//! use smite_transport_quic::SecureChannelManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Panel side
//! let panel = SecureChannelManager::bootstrap_panel("certs", "panel", IdentityOptions::default())?;
//! let listener = panel.listen("0.0.0.0:4443".parse()?)?;
//!
//! // Node side
//! let node = SecureChannelManager::from_files(&IdentityPaths::node_in("node-certs"))?;
//! let connection = node.open_channel("10.0.0.1:4443".parse()?, "panel").await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod stream;

pub use channel::SecureChannelManager;
pub use config::ChannelConfig;
pub use connection::ChannelConnection;
pub use error::{ChannelError, ChannelResult};
pub use listener::{ChannelConnector, ChannelListener};
pub use stream::ChannelStream;
