//! Per-tunnel exclusive sections

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per tunnel id
///
/// Operations on different tunnels never wait on each other. The guard is
/// owned, so it is released on every exit path including cancellation.
#[derive(Debug, Default)]
pub struct TunnelLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TunnelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `tunnel_id`
    pub async fn acquire(&self, tunnel_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(tunnel_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
