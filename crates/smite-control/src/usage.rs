//! Usage collection for Active tunnels
//!
//! Readings are monotonic within a tunnel generation. A re-apply starts a new
//! generation and with it a new counting epoch, so a counter that restarts
//! from zero after a re-apply is never mistaken for a decrease.

use crate::adapter::AdapterError;
use crate::error::{TunnelError, UsageUnavailableReason};
use crate::manager::AdapterManager;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smite_proto::{TunnelState, UsageSample};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where usage samples are delivered upstream
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn report(&self, samples: Vec<UsageSample>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Which side a reconciled usage value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    /// Measured by the tunnel's adapter on this node
    Adapter,
    /// Reported by the client; accepted only when the adapter cannot meter
    Client,
}

#[derive(Debug, Clone)]
pub struct UsageCollector {
    manager: AdapterManager,
    latest: Arc<DashMap<String, UsageSample>>,
}

impl UsageCollector {
    pub fn new(manager: AdapterManager) -> Self {
        Self {
            manager,
            latest: Arc::new(DashMap::new()),
        }
    }

    /// Read current usage of one Active tunnel from its adapter
    pub async fn sample(&self, tunnel_id: &str) -> Result<UsageSample, TunnelError> {
        let record = self.manager.registry().get(tunnel_id)?;
        if record.current_state != TunnelState::Active {
            return Err(TunnelError::usage_unavailable(
                tunnel_id,
                UsageUnavailableReason::NotActive(record.current_state),
            ));
        }

        let adapter = self
            .manager
            .adapters()
            .get(record.tunnel_type)
            .filter(|a| a.supports_usage())
            .ok_or_else(|| TunnelError::usage_unavailable(tunnel_id, UsageUnavailableReason::Unsupported))?;
        let spec = record.applied_spec.as_ref().unwrap_or(&record.desired_spec);

        let timeout = self.manager.operation_timeout();
        let bytes = match tokio::time::timeout(timeout, adapter.usage(tunnel_id, spec)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(AdapterError::Unsupported)) => {
                return Err(TunnelError::usage_unavailable(tunnel_id, UsageUnavailableReason::Unsupported))
            }
            Ok(Err(e)) => {
                return Err(TunnelError::usage_unavailable(
                    tunnel_id,
                    UsageUnavailableReason::Backend(e.to_string()),
                ))
            }
            Err(_) => {
                return Err(TunnelError::Timeout {
                    tunnel_id: tunnel_id.to_string(),
                    operation: "usage",
                    timeout,
                })
            }
        };

        // The tunnel may have been re-applied or removed while the adapter was read.
        let current = self.manager.registry().get(tunnel_id)?;
        if current.current_state != TunnelState::Active {
            return Err(TunnelError::usage_unavailable(
                tunnel_id,
                UsageUnavailableReason::NotActive(current.current_state),
            ));
        }
        if current.generation != record.generation {
            return Err(TunnelError::usage_unavailable(
                tunnel_id,
                UsageUnavailableReason::Backend("tunnel was re-applied during sampling".to_string()),
            ));
        }

        let sample = self.store(UsageSample {
            tunnel_id: tunnel_id.to_string(),
            bytes_used: bytes,
            sampled_at: Utc::now(),
            generation: record.generation,
        });
        debug!(
            tunnel_id,
            tunnel_type = %record.tunnel_type,
            bytes_used = sample.bytes_used,
            generation = sample.generation,
            "Usage sampled"
        );
        Ok(sample)
    }

    /// Keep the newest sample, never letting a generation's value go down
    fn store(&self, mut sample: UsageSample) -> UsageSample {
        let mut entry = self
            .latest
            .entry(sample.tunnel_id.clone())
            .or_insert_with(|| sample.clone());
        let previous = entry.value();
        if previous.generation == sample.generation {
            sample.bytes_used = sample.bytes_used.max(previous.bytes_used);
        }
        *entry = sample.clone();
        sample
    }

    /// Sample every Active tunnel; tunnels that cannot be sampled are skipped
    pub async fn sample_all(&self) -> Vec<UsageSample> {
        let active = self.manager.registry().active_ids();
        self.latest.retain(|id, _| active.contains(id));

        let mut samples = Vec::with_capacity(active.len());
        for tunnel_id in &active {
            match self.sample(tunnel_id).await {
                Ok(sample) => samples.push(sample),
                Err(TunnelError::UsageUnavailable {
                    reason: UsageUnavailableReason::Unsupported,
                    ..
                }) => {}
                Err(e) => warn!(tunnel_id = %tunnel_id, error = %e, "Usage sampling failed"),
            }
        }
        samples
    }

    /// Most recent sample for a tunnel, if any
    pub fn latest(&self, tunnel_id: &str) -> Option<UsageSample> {
        self.latest.get(tunnel_id).map(|s| s.clone())
    }

    /// Decide the authoritative usage for a client-pushed value
    ///
    /// The adapter's reading wins whenever the adapter can meter the tunnel.
    /// If it cannot, the client's value is accepted for an Active tunnel.
    /// Non-Active and unknown tunnels are rejected either way.
    pub async fn reconcile(
        &self,
        tunnel_id: &str,
        client_bytes: u64,
    ) -> Result<(UsageSample, UsageSource), TunnelError> {
        match self.sample(tunnel_id).await {
            Ok(sample) => {
                if sample.bytes_used != client_bytes {
                    debug!(
                        tunnel_id,
                        client_bytes,
                        adapter_bytes = sample.bytes_used,
                        "Client usage overridden by adapter"
                    );
                }
                Ok((sample, UsageSource::Adapter))
            }
            Err(TunnelError::UsageUnavailable {
                reason: UsageUnavailableReason::Unsupported,
                ..
            }) => {
                let record = self.manager.registry().get(tunnel_id)?;
                let sample = self.store(UsageSample {
                    tunnel_id: tunnel_id.to_string(),
                    bytes_used: client_bytes,
                    sampled_at: Utc::now(),
                    generation: record.generation,
                });
                debug!(tunnel_id, bytes_used = sample.bytes_used, "Client usage accepted");
                Ok((sample, UsageSource::Client))
            }
            Err(e) => Err(e),
        }
    }

    /// Sample on every tick and hand non-empty batches to `sink`
    ///
    /// Runs until the surrounding task is dropped. A failed delivery is
    /// logged and the next tick samples afresh.
    pub async fn run(&self, interval: Duration, sink: &dyn UsageSink) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Usage collector started");

        loop {
            ticker.tick().await;
            let samples = self.sample_all().await;
            if samples.is_empty() {
                continue;
            }
            let count = samples.len();
            match sink.report(samples).await {
                Ok(()) => debug!(samples = count, "Usage reported"),
                Err(e) => warn!(samples = count, error = %e, "Usage report failed"),
            }
        }
    }
}
