//! In-process TCP port forward

use super::require_host_port;
use crate::adapter::{AdapterError, BackendStatus, TunnelAdapter};
use crate::task_tracker::TaskTracker;
use async_trait::async_trait;
use dashmap::DashMap;
use smite_proto::{TunnelSpec, TunnelType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Forwarder {
    local_addr: SocketAddr,
    bytes: Arc<AtomicU64>,
}

/// Forwards every connection accepted on `listen` to `target`
#[derive(Debug, Default)]
pub struct TcpAdapter {
    tasks: TaskTracker,
    forwarders: DashMap<String, Forwarder>,
}

impl TcpAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the tunnel's listener is bound to
    pub fn local_addr(&self, tunnel_id: &str) -> Option<SocketAddr> {
        self.forwarders.get(tunnel_id).map(|f| f.local_addr)
    }

    async fn stop(&self, tunnel_id: &str) -> bool {
        let stopped = self.tasks.stop(tunnel_id).await;
        self.forwarders.remove(tunnel_id);
        stopped
    }
}

#[async_trait]
impl TunnelAdapter for TcpAdapter {
    fn tunnel_type(&self) -> TunnelType {
        TunnelType::Tcp
    }

    fn validate(&self, _tunnel_id: &str, spec: &TunnelSpec) -> Result<(), String> {
        require_host_port(spec, "listen")?;
        require_host_port(spec, "target")?;
        Ok(())
    }

    async fn apply(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<(), AdapterError> {
        let listen = require_host_port(spec, "listen").map_err(AdapterError::Backend)?;
        let target = require_host_port(spec, "target")
            .map_err(AdapterError::Backend)?
            .to_string();

        // The old listener must release its port before a re-apply binds again.
        self.stop(tunnel_id).await;

        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| AdapterError::io(format!("bind {}", listen), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AdapterError::io("listener address", e))?;

        let bytes = Arc::new(AtomicU64::new(0));
        self.forwarders.insert(
            tunnel_id.to_string(),
            Forwarder {
                local_addr,
                bytes: bytes.clone(),
            },
        );

        let handle = tokio::spawn(accept_loop(tunnel_id.to_string(), listener, target.clone(), bytes));
        self.tasks.register(tunnel_id, handle);

        info!(tunnel_id, %local_addr, target = %target, "TCP forwarder started");
        Ok(())
    }

    async fn remove(&self, tunnel_id: &str, _spec: &TunnelSpec) -> Result<(), AdapterError> {
        let stopped = self.stop(tunnel_id).await;
        debug!(tunnel_id, stopped, "TCP forwarder removed");
        Ok(())
    }

    async fn status(&self, tunnel_id: &str, _spec: &TunnelSpec) -> Result<BackendStatus, AdapterError> {
        let running = self.tasks.is_running(tunnel_id);
        Ok(BackendStatus {
            present: self.forwarders.contains_key(tunnel_id),
            running,
            detail: self.local_addr(tunnel_id).map(|addr| format!("listening on {}", addr)),
        })
    }

    fn supports_usage(&self) -> bool {
        true
    }

    async fn usage(&self, tunnel_id: &str, _spec: &TunnelSpec) -> Result<u64, AdapterError> {
        self.forwarders
            .get(tunnel_id)
            .map(|f| f.bytes.load(Ordering::Relaxed))
            .ok_or_else(|| AdapterError::Backend(format!("no forwarder for tunnel {}", tunnel_id)))
    }
}

const MIN_ACCEPT_PAUSE: Duration = Duration::from_millis(10);
const MAX_ACCEPT_PAUSE: Duration = Duration::from_secs(1);

/// Pause after a failed `accept`, doubling while failures persist (EMFILE
/// and friends do not clear on their own)
#[derive(Debug, Default)]
struct AcceptPause {
    current: Option<Duration>,
}

impl AcceptPause {
    fn after_error(&mut self) -> Duration {
        let next = match self.current {
            None => MIN_ACCEPT_PAUSE,
            Some(previous) => (previous * 2).min(MAX_ACCEPT_PAUSE),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Owns every connection it spawns, so aborting it closes them all
async fn accept_loop(tunnel_id: String, listener: TcpListener, target: String, bytes: Arc<AtomicU64>) {
    let mut connections = JoinSet::new();
    let mut pause = AcceptPause::default();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((client, peer)) => {
                    pause.reset();
                    debug!(tunnel_id = %tunnel_id, %peer, "TCP connection accepted");
                    connections.spawn(forward(client, target.clone(), bytes.clone()));
                }
                Err(e) => {
                    let delay = pause.after_error();
                    warn!(
                        tunnel_id = %tunnel_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "TCP accept failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            },
            Some(finished) = connections.join_next() => {
                if let Ok(Err(e)) = finished {
                    debug!(tunnel_id = %tunnel_id, error = %e, "TCP connection closed with error");
                }
            }
        }
    }
}

async fn forward(client: TcpStream, target: String, bytes: Arc<AtomicU64>) -> std::io::Result<()> {
    let upstream = TcpStream::connect(&target).await?;
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let (up, down) = tokio::join!(
        pump(client_read, upstream_write, bytes.clone()),
        pump(upstream_read, client_write, bytes),
    );
    up?;
    down?;
    Ok(())
}

/// Copy until EOF, counting every byte written
async fn pump<R, W>(mut reader: R, mut writer: W, bytes: Arc<AtomicU64>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}
