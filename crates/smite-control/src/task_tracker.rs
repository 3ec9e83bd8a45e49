//! Task tracking for in-process tunnel backends
//!
//! Holds the JoinHandle of each tunnel's forwarder task so that removal or
//! re-apply can stop it and wait until its sockets are released.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Tracks background tasks associated with tunnels
#[derive(Debug, Default)]
pub struct TaskTracker {
    /// Map of tunnel_id -> task handle
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task for a tunnel, aborting any previous one
    pub fn register(&self, tunnel_id: &str, handle: JoinHandle<()>) {
        if let Some(old_handle) = self.tasks().insert(tunnel_id.to_string(), handle) {
            old_handle.abort();
        }
    }

    /// Abort a tunnel's task and wait for it to finish
    ///
    /// Returns whether a task was registered.
    pub async fn stop(&self, tunnel_id: &str) -> bool {
        let handle = self.tasks().remove(tunnel_id);
        match handle {
            Some(handle) => {
                handle.abort();
                // Cancelled (or already finished); either way its resources are gone.
                let _ = handle.await;
                debug!(tunnel_id, "Stopped tunnel task");
                true
            }
            None => false,
        }
    }

    /// Whether the tunnel has a task that is still running
    pub fn is_running(&self, tunnel_id: &str) -> bool {
        self.tasks()
            .get(tunnel_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }
}

impl Drop for TaskTracker {
    fn drop(&mut self) {
        for (_, handle) in self.tasks().drain() {
            handle.abort();
        }
    }
}
