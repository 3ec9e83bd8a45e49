//! HTTP surfaces for nodes and the panel
//!
//! The node API fronts a node's `AdapterManager` and `UsageCollector`; the
//! panel API lets an operator drive tunnels on connected nodes.

pub mod error;
pub mod models;
pub mod node;
pub mod panel;

use axum::Router;
use std::net::SocketAddr;
use tracing::info;

pub use error::ApiError;
pub use node::{node_router, NodeApiDoc};
pub use panel::{panel_router, PanelApiDoc};

/// Serve `router` on `bind_addr` until the task is dropped
pub async fn serve(bind_addr: SocketAddr, router: Router) -> Result<(), anyhow::Error> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    info!("Starting API server on {}", listener.local_addr()?);
    info!("OpenAPI spec: http://{}/openapi.json", bind_addr);

    axum::serve(listener, router)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
