//! Smite node agent
//!
//! Connects a node to its panel over the secure channel and serves the
//! panel's tunnel requests against the node's `AdapterManager`, while
//! streaming usage of Active tunnels back upstream.

mod agent;
pub mod dispatch;
pub mod reconnect;

pub use agent::{Agent, AgentConfig, AgentError};
pub use dispatch::dispatch;
pub use reconnect::{Backoff, ReconnectConfig, ReconnectError};
