//! Adapter manager: drives tunnel operations against their backends
//!
//! Every mutating operation on a tunnel runs inside that tunnel's exclusive
//! section, so apply and remove on the same id never interleave. Operations
//! on different tunnels proceed independently; reads never take the lock.

use crate::adapter::{AdapterError, AdapterSet, BackendStatus, TunnelAdapter};
use crate::error::TunnelError;
use crate::locks::TunnelLocks;
use crate::registry::TunnelRegistry;
use smite_proto::{validate_tunnel_id, TunnelIntent, TunnelRecord, TunnelSpec, TunnelState};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on a single adapter call
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a removal: the record always ends `Removed`, a backend teardown
/// problem is reported alongside rather than failing the call
#[derive(Debug, Clone)]
pub struct RemoveOutcome {
    pub record: TunnelRecord,
    pub teardown_error: Option<TunnelError>,
}

/// What `AdapterManager::restore` did with each restored record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Active before the restart and applied again
    pub reapplied: Vec<String>,
    /// Interrupted mid-apply, or failed to re-apply
    pub failed: Vec<String>,
    /// Interrupted mid-removal and finished now
    pub removed: Vec<String>,
}

#[derive(Debug)]
struct ManagerInner {
    registry: TunnelRegistry,
    adapters: AdapterSet,
    locks: TunnelLocks,
    /// Held while a tunnel claims its backend resource and enters `Applying`
    claims: Mutex<()>,
}

/// Shared handle to the node's tunnel control core
#[derive(Debug, Clone)]
pub struct AdapterManager {
    inner: Arc<ManagerInner>,
    operation_timeout: Duration,
}

impl AdapterManager {
    pub fn new(registry: TunnelRegistry, adapters: AdapterSet) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                adapters,
                locks: TunnelLocks::new(),
                claims: Mutex::new(()),
            }),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.inner.registry
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.inner.adapters
    }

    /// Bring a tunnel to the given configuration
    ///
    /// The id, type and spec are all checked before any record is created or
    /// touched. On adapter failure the record is left `Failed` with the
    /// detail in `last_error`, and the error is returned.
    pub async fn apply_tunnel(
        &self,
        tunnel_id: &str,
        tunnel_type: &str,
        spec: TunnelSpec,
    ) -> Result<TunnelRecord, TunnelError> {
        validate_tunnel_id(tunnel_id)?;
        let (tunnel_type, adapter) = self.inner.adapters.resolve(tunnel_type)?;
        adapter
            .validate(tunnel_id, &spec)
            .map_err(|reason| TunnelError::InvalidSpec {
                tunnel_id: tunnel_id.to_string(),
                tunnel_type,
                reason,
            })?;

        let intent = TunnelIntent {
            tunnel_id: tunnel_id.to_string(),
            tunnel_type,
            spec,
        };

        // Detached so a dropped caller cannot stop the operation between state changes.
        let manager = self.clone();
        tokio::spawn(async move { manager.apply_locked(intent, adapter).await })
            .await
            .map_err(|e| TunnelError::Aborted {
                tunnel_id: tunnel_id.to_string(),
                reason: e.to_string(),
            })?
    }

    async fn apply_locked(
        &self,
        intent: TunnelIntent,
        adapter: Arc<dyn TunnelAdapter>,
    ) -> Result<TunnelRecord, TunnelError> {
        let tunnel_id = intent.tunnel_id.as_str();
        let _guard = self.inner.locks.acquire(tunnel_id).await;
        let registry = &self.inner.registry;

        info!(tunnel_id, tunnel_type = %intent.tunnel_type, "Applying tunnel");

        let previous = registry.get(tunnel_id).ok();
        if let Some(previous) = &previous {
            if !previous.current_state.can_restart() {
                return Err(TunnelError::InvalidTransition {
                    tunnel_id: tunnel_id.to_string(),
                    from: previous.current_state,
                    to: TunnelState::Pending,
                });
            }
        }

        self.claim(&intent, adapter.as_ref())?;

        if let Some(previous) = previous
            .filter(|p| matches!(p.current_state, TunnelState::Active | TunnelState::Failed))
        {
            self.teardown(&previous).await;
        }

        let outcome = match self
            .bounded(tunnel_id, "apply", adapter.apply(tunnel_id, &intent.spec))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TunnelError::Apply {
                tunnel_id: tunnel_id.to_string(),
                reason: e.to_string(),
            }),
            Err(timeout) => Err(timeout),
        };

        match outcome {
            Ok(()) => {
                let record = registry.mark_active(tunnel_id, intent.spec.clone())?;
                info!(
                    tunnel_id,
                    tunnel_type = %intent.tunnel_type,
                    generation = record.generation,
                    "Tunnel active"
                );
                Ok(record)
            }
            Err(err) => {
                registry.fail(tunnel_id, err.to_string())?;
                error!(
                    tunnel_id,
                    tunnel_type = %intent.tunnel_type,
                    error = %err,
                    "Tunnel apply failed"
                );
                Err(err)
            }
        }
    }

    /// Record the intent and move it to `Applying`, unless another live tunnel
    /// of the same type already owns the backend resource it needs
    fn claim(&self, intent: &TunnelIntent, adapter: &dyn TunnelAdapter) -> Result<(), TunnelError> {
        let tunnel_id = intent.tunnel_id.as_str();
        let registry = &self.inner.registry;
        let _claims = self.inner.claims.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(resource) = adapter.backend_key(tunnel_id, &intent.spec) {
            let owner = registry.list().into_iter().find(|other| {
                let spec = match other.current_state {
                    TunnelState::Applying => &other.desired_spec,
                    TunnelState::Active | TunnelState::Removing => {
                        other.applied_spec.as_ref().unwrap_or(&other.desired_spec)
                    }
                    TunnelState::Pending | TunnelState::Failed | TunnelState::Removed => return false,
                };
                other.tunnel_id != tunnel_id
                    && other.tunnel_type == intent.tunnel_type
                    && adapter.backend_key(&other.tunnel_id, spec).as_deref() == Some(resource.as_str())
            });
            if let Some(owner) = owner {
                warn!(
                    tunnel_id,
                    tunnel_type = %intent.tunnel_type,
                    resource = %resource,
                    owner = %owner.tunnel_id,
                    "Backend resource already in use"
                );
                return Err(TunnelError::BackendConflict {
                    tunnel_id: tunnel_id.to_string(),
                    resource,
                    owner: owner.tunnel_id,
                });
            }
        }

        registry.upsert(intent)?;
        registry.transition(tunnel_id, TunnelState::Applying)?;
        Ok(())
    }

    /// Best-effort removal of whatever a previous generation left behind
    async fn teardown(&self, previous: &TunnelRecord) {
        let Some(adapter) = self.inner.adapters.get(previous.tunnel_type) else {
            return;
        };
        let tunnel_id = previous.tunnel_id.as_str();
        let spec = previous.applied_spec.as_ref().unwrap_or(&previous.desired_spec);

        match self.bounded(tunnel_id, "remove", adapter.remove(tunnel_id, spec)).await {
            Ok(Ok(())) => debug!(tunnel_id, "Previous tunnel configuration removed"),
            Ok(Err(e)) => warn!(tunnel_id, error = %e, "Failed to remove previous tunnel configuration"),
            Err(e) => warn!(tunnel_id, error = %e, "Failed to remove previous tunnel configuration"),
        }
    }

    /// Tear a tunnel down
    ///
    /// Unknown ids fail with `NotFound`. For a known id this always ends in
    /// `Removed`; removing an already removed tunnel succeeds unchanged.
    pub async fn remove_tunnel(&self, tunnel_id: &str) -> Result<RemoveOutcome, TunnelError> {
        let manager = self.clone();
        let id = tunnel_id.to_string();
        tokio::spawn(async move { manager.remove_locked(&id).await })
            .await
            .map_err(|e| TunnelError::Aborted {
                tunnel_id: tunnel_id.to_string(),
                reason: e.to_string(),
            })?
    }

    async fn remove_locked(&self, tunnel_id: &str) -> Result<RemoveOutcome, TunnelError> {
        let guard = self.inner.locks.acquire(tunnel_id).await;
        let registry = &self.inner.registry;

        let record = registry.get(tunnel_id)?;
        if record.current_state == TunnelState::Removed {
            debug!(tunnel_id, "Tunnel already removed");
            return Ok(RemoveOutcome {
                record,
                teardown_error: None,
            });
        }

        info!(tunnel_id, tunnel_type = %record.tunnel_type, state = %record.current_state, "Removing tunnel");
        if record.current_state != TunnelState::Removing {
            registry.transition(tunnel_id, TunnelState::Removing)?;
        }

        let teardown_error = match self.inner.adapters.get(record.tunnel_type) {
            Some(adapter) => {
                let spec = record.applied_spec.as_ref().unwrap_or(&record.desired_spec);
                match self.bounded(tunnel_id, "remove", adapter.remove(tunnel_id, spec)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(TunnelError::Remove {
                        tunnel_id: tunnel_id.to_string(),
                        reason: e.to_string(),
                    }),
                    Err(timeout) => Some(timeout),
                }
            }
            None => None,
        };

        if let Some(err) = &teardown_error {
            warn!(tunnel_id, error = %err, "Backend teardown failed; tunnel removed anyway");
        }

        let record = registry.remove(tunnel_id, teardown_error.as_ref().map(|e| e.to_string()))?;
        info!(tunnel_id, "Tunnel removed");

        drop(guard);
        self.inner.locks.prune();

        Ok(RemoveOutcome {
            record,
            teardown_error,
        })
    }

    /// Current record for a tunnel; unknown ids are `NotFound`
    pub fn get_tunnel_status(&self, tunnel_id: &str) -> Result<TunnelRecord, TunnelError> {
        let record = self.inner.registry.get(tunnel_id)?;
        debug!(
            tunnel_id,
            tunnel_type = %record.tunnel_type,
            state = %record.current_state,
            "Tunnel status read"
        );
        Ok(record)
    }

    pub fn list_tunnels(&self) -> Vec<TunnelRecord> {
        self.inner.registry.list()
    }

    /// Ask the tunnel's backend what it currently sees
    pub async fn backend_status(&self, tunnel_id: &str) -> Result<BackendStatus, TunnelError> {
        let record = self.inner.registry.get(tunnel_id)?;
        let adapter = self
            .inner
            .adapters
            .get(record.tunnel_type)
            .ok_or_else(|| TunnelError::UnsupportedTunnelType(record.tunnel_type.to_string()))?;
        let spec = record.applied_spec.as_ref().unwrap_or(&record.desired_spec);

        self.bounded(tunnel_id, "status", adapter.status(tunnel_id, spec))
            .await?
            .map_err(|e| TunnelError::Backend {
                tunnel_id: tunnel_id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Bring backends back in line with a registry restored from disk
    pub async fn restore(&self) -> RestoreReport {
        let mut report = RestoreReport::default();

        for record in self.inner.registry.list() {
            let tunnel_id = record.tunnel_id.clone();
            match record.current_state {
                TunnelState::Active => {
                    let spec = record.applied_spec.unwrap_or(record.desired_spec);
                    match self
                        .apply_tunnel(&tunnel_id, record.tunnel_type.as_str(), spec)
                        .await
                    {
                        Ok(_) => report.reapplied.push(tunnel_id),
                        Err(e) => {
                            warn!(tunnel_id = %tunnel_id, error = %e, "Failed to re-apply tunnel after restart");
                            report.failed.push(tunnel_id);
                        }
                    }
                }
                TunnelState::Applying => {
                    let _guard = self.inner.locks.acquire(&tunnel_id).await;
                    if let Err(e) = self.inner.registry.fail(&tunnel_id, "interrupted by restart") {
                        warn!(tunnel_id = %tunnel_id, error = %e, "Failed to mark interrupted tunnel");
                    }
                    report.failed.push(tunnel_id);
                }
                TunnelState::Removing => match self.remove_tunnel(&tunnel_id).await {
                    Ok(_) => report.removed.push(tunnel_id),
                    Err(e) => warn!(tunnel_id = %tunnel_id, error = %e, "Failed to finish removal after restart"),
                },
                TunnelState::Pending | TunnelState::Failed | TunnelState::Removed => {}
            }
        }

        info!(
            reapplied = report.reapplied.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "Tunnel registry restored"
        );
        report
    }

    /// Run an adapter call under the operation timeout
    async fn bounded<T, F>(
        &self,
        tunnel_id: &str,
        operation: &'static str,
        call: F,
    ) -> Result<Result<T, AdapterError>, TunnelError>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        tokio::time::timeout(self.operation_timeout, call)
            .await
            .map_err(|_| TunnelError::Timeout {
                tunnel_id: tunnel_id.to_string(),
                operation,
                timeout: self.operation_timeout,
            })
    }
}
