//! Tunnel registry: one record per tunnel id
//!
//! The registry owns every `TunnelRecord` on a node. It validates state
//! transitions but does not serialize operations; callers hold the per-tunnel
//! lock from `TunnelLocks` around multi-step changes.

use crate::error::TunnelError;
use chrono::Utc;
use smite_proto::{TunnelIntent, TunnelRecord, TunnelSpec, TunnelState};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

/// File name of the registry snapshot inside the state directory
pub const SNAPSHOT_FILE: &str = "registry.json";

#[derive(Debug)]
struct Snapshot {
    path: PathBuf,
    /// Orders snapshot writes so the newest state always lands last
    write_lock: Mutex<()>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: RwLock<HashMap<String, TunnelRecord>>,
    snapshot: Option<Snapshot>,
}

/// Registry of tunnel records, cheap to clone and share
#[derive(Debug, Clone, Default)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

impl TunnelRegistry {
    /// In-memory registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry persisted as a JSON snapshot in `state_dir`, restoring any
    /// snapshot already there
    pub fn with_snapshot(state_dir: impl AsRef<Path>) -> Result<Self, TunnelError> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir).map_err(|e| {
            TunnelError::Persistence(format!("create {}: {}", state_dir.display(), e))
        })?;
        let path = state_dir.join(SNAPSHOT_FILE);

        let records = match std::fs::read(&path) {
            Ok(bytes) => {
                let list: Vec<TunnelRecord> = serde_json::from_slice(&bytes).map_err(|e| {
                    TunnelError::Persistence(format!("parse {}: {}", path.display(), e))
                })?;
                list.into_iter().map(|r| (r.tunnel_id.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(TunnelError::Persistence(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        info!(
            path = %path.display(),
            tunnels = records.len(),
            "Tunnel registry loaded"
        );

        Ok(Self {
            inner: Arc::new(RegistryInner {
                records: RwLock::new(records),
                snapshot: Some(Snapshot {
                    path,
                    write_lock: Mutex::new(()),
                }),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TunnelRecord>> {
        // Records are replaced whole, so a panicked writer cannot leave one half-updated.
        self.inner.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TunnelRecord>> {
        self.inner.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept an intent, replacing any previous configuration for its id
    ///
    /// An existing record starts a new generation at `Pending`; its spec is
    /// replaced, never merged.
    pub fn upsert(&self, intent: &TunnelIntent) -> Result<TunnelRecord, TunnelError> {
        let record = {
            let mut records = self.write();
            let record = match records.get(&intent.tunnel_id) {
                None => TunnelRecord::new(intent),
                Some(existing) => {
                    if !existing.current_state.can_restart() {
                        return Err(TunnelError::InvalidTransition {
                            tunnel_id: intent.tunnel_id.clone(),
                            from: existing.current_state,
                            to: TunnelState::Pending,
                        });
                    }
                    TunnelRecord {
                        tunnel_type: intent.tunnel_type,
                        current_state: TunnelState::Pending,
                        last_error: None,
                        desired_spec: intent.spec.clone(),
                        applied_spec: None,
                        generation: existing.generation + 1,
                        updated_at: Utc::now(),
                        ..existing.clone()
                    }
                }
            };
            records.insert(record.tunnel_id.clone(), record.clone());
            record
        };

        debug!(
            tunnel_id = %record.tunnel_id,
            generation = record.generation,
            "Tunnel intent accepted"
        );
        self.persist();
        Ok(record)
    }

    pub fn get(&self, tunnel_id: &str) -> Result<TunnelRecord, TunnelError> {
        self.read()
            .get(tunnel_id)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))
    }

    /// All records, ordered by tunnel id
    pub fn list(&self) -> Vec<TunnelRecord> {
        let mut records: Vec<_> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        records
    }

    /// Ids of Active tunnels, ordered
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .read()
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.tunnel_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn update(
        &self,
        tunnel_id: &str,
        f: impl FnOnce(&mut TunnelRecord) -> Result<(), TunnelError>,
    ) -> Result<TunnelRecord, TunnelError> {
        let record = {
            let mut records = self.write();
            let record = records
                .get_mut(tunnel_id)
                .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;
            let mut next = record.clone();
            f(&mut next)?;
            next.updated_at = Utc::now();
            *record = next.clone();
            next
        };
        self.persist();
        Ok(record)
    }

    fn step(record: &mut TunnelRecord, next: TunnelState) -> Result<(), TunnelError> {
        if !record.current_state.can_transition_to(next) {
            return Err(TunnelError::InvalidTransition {
                tunnel_id: record.tunnel_id.clone(),
                from: record.current_state,
                to: next,
            });
        }
        record.current_state = next;
        Ok(())
    }

    /// Move a tunnel along a legal edge of its lifecycle
    pub fn transition(&self, tunnel_id: &str, next: TunnelState) -> Result<TunnelRecord, TunnelError> {
        self.update(tunnel_id, |r| Self::step(r, next))
    }

    /// `Applying -> Active`, recording what the adapter applied
    pub fn mark_active(&self, tunnel_id: &str, applied: TunnelSpec) -> Result<TunnelRecord, TunnelError> {
        self.update(tunnel_id, |r| {
            Self::step(r, TunnelState::Active)?;
            r.applied_spec = Some(applied);
            r.last_error = None;
            Ok(())
        })
    }

    /// `Applying -> Failed` with the failure detail
    pub fn fail(&self, tunnel_id: &str, error: impl Into<String>) -> Result<TunnelRecord, TunnelError> {
        let error = error.into();
        self.update(tunnel_id, |r| {
            Self::step(r, TunnelState::Failed)?;
            r.last_error = Some(error);
            Ok(())
        })
    }

    /// Finish removal: the record ends in `Removed` whatever state it was in
    ///
    /// Idempotent; an already removed record is returned unchanged. A
    /// teardown problem is kept in `last_error` for operators.
    pub fn remove(&self, tunnel_id: &str, teardown_error: Option<String>) -> Result<TunnelRecord, TunnelError> {
        if self.get(tunnel_id)?.current_state == TunnelState::Removed {
            return self.get(tunnel_id);
        }
        self.update(tunnel_id, |r| {
            if r.current_state != TunnelState::Removing {
                Self::step(r, TunnelState::Removing)?;
            }
            Self::step(r, TunnelState::Removed)?;
            r.applied_spec = None;
            r.last_error = teardown_error;
            Ok(())
        })
    }

    /// Write the snapshot, if configured
    ///
    /// Memory stays authoritative: a failed write is logged, not surfaced, so
    /// a full disk cannot wedge tunnel operations.
    fn persist(&self) {
        let Some(snapshot) = &self.inner.snapshot else {
            return;
        };
        let _guard = snapshot.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let records = self.list();

        if let Err(e) = write_snapshot(&snapshot.path, &records) {
            error!(path = %snapshot.path.display(), error = %e, "Failed to persist tunnel registry");
        }
    }
}

fn write_snapshot(path: &Path, records: &[TunnelRecord]) -> Result<(), TunnelError> {
    let json = serde_json::to_vec_pretty(records)
        .map_err(|e| TunnelError::Persistence(e.to_string()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let io = |e: std::io::Error| TunnelError::Persistence(format!("{}: {}", path.display(), e));
    let mut tmp = NamedTempFile::new_in(dir).map_err(io)?;
    tmp.write_all(&json).map_err(io)?;
    tmp.as_file().sync_all().map_err(io)?;
    tmp.persist(path).map_err(|e| io(e.error))?;
    Ok(())
}
