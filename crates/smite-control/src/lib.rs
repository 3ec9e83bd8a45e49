//! Node-side tunnel control
//!
//! This crate owns everything a node needs to turn tunnel intents into running
//! tunnels:
//! - `TunnelRegistry`: one `TunnelRecord` per tunnel id, optionally persisted
//! - `AdapterManager`: per-tunnel serialized apply/remove/status against the
//!   adapter selected by tunnel type
//! - `UsageCollector`: usage sampling for Active tunnels
//!
//! # Example
//!
//! ```no_run
//! use smite_control::{AdapterManager, AdapterSet, AdapterSettings, TunnelRegistry};
//! use smite_proto::TunnelSpec;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = AdapterSettings::default();
//! let registry = TunnelRegistry::with_snapshot(&settings.state_dir)?;
//! let manager = AdapterManager::new(registry, AdapterSet::standard(&settings));
//!
//! let spec = TunnelSpec::try_from(serde_json::json!({"endpoint": "1.2.3.4:51820"}))?;
//! let record = manager.apply_tunnel("t1", "wireguard", spec).await?;
//! println!("{} is {}", record.tunnel_id, record.current_state);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod adapters;
pub mod error;
pub mod locks;
pub mod manager;
pub mod registry;
pub mod task_tracker;
pub mod usage;

pub use adapter::{AdapterError, AdapterSet, AdapterSettings, BackendStatus, TunnelAdapter};
pub use adapters::{Hysteria2Adapter, TcpAdapter, WireguardAdapter};
pub use error::{TunnelError, UsageUnavailableReason};
pub use locks::TunnelLocks;
pub use manager::{AdapterManager, RemoveOutcome, RestoreReport, DEFAULT_OPERATION_TIMEOUT};
pub use registry::{TunnelRegistry, SNAPSHOT_FILE};
pub use task_tracker::TaskTracker;
pub use usage::{UsageCollector, UsageSink, UsageSource};
