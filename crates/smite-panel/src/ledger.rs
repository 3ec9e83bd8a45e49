//! Latest usage reported by each node, per tunnel

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smite_proto::{validate_tunnel_id, UsageSample};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct NodeUsage {
    pub node_id: String,
    pub tunnel_id: String,
    pub bytes_used: u64,
    pub sampled_at: DateTime<Utc>,
    pub generation: u64,
}

impl NodeUsage {
    fn new(node_id: &str, sample: &UsageSample) -> Self {
        Self {
            node_id: node_id.to_string(),
            tunnel_id: sample.tunnel_id.clone(),
            bytes_used: sample.bytes_used,
            sampled_at: sample.sampled_at,
            generation: sample.generation,
        }
    }
}

/// Keeps one sample per (node, tunnel)
///
/// Reports can arrive late or out of order; a sample is kept only if it is
/// from a newer generation, or from the same generation and not behind the
/// stored one.
#[derive(Debug, Clone, Default)]
pub struct UsageLedger {
    samples: Arc<DashMap<(String, String), UsageSample>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch from one node; returns how many samples were kept
    pub fn record(&self, node_id: &str, samples: Vec<UsageSample>) -> u32 {
        let mut accepted = 0;
        for sample in samples {
            if validate_tunnel_id(&sample.tunnel_id).is_err() {
                debug!(node_id, tunnel_id = %sample.tunnel_id, "Usage sample with invalid tunnel id dropped");
                continue;
            }

            let key = (node_id.to_string(), sample.tunnel_id.clone());
            let newer = match self.samples.get(&key) {
                None => true,
                Some(stored) => {
                    sample.generation > stored.generation
                        || (sample.generation == stored.generation
                            && sample.bytes_used >= stored.bytes_used
                            && sample.sampled_at >= stored.sampled_at)
                }
            };

            if newer {
                self.samples.insert(key, sample);
                accepted += 1;
            } else {
                debug!(node_id, tunnel_id = %sample.tunnel_id, "Stale usage sample ignored");
            }
        }
        accepted
    }

    pub fn get(&self, node_id: &str, tunnel_id: &str) -> Option<UsageSample> {
        self.samples
            .get(&(node_id.to_string(), tunnel_id.to_string()))
            .map(|s| s.clone())
    }

    /// Everything recorded, ordered by node then tunnel
    pub fn list(&self) -> Vec<NodeUsage> {
        let mut usage: Vec<_> = self
            .samples
            .iter()
            .map(|entry| NodeUsage::new(&entry.key().0, entry.value()))
            .collect();
        usage.sort_by(|a, b| (&a.node_id, &a.tunnel_id).cmp(&(&b.node_id, &b.tunnel_id)));
        usage
    }

    pub fn for_node(&self, node_id: &str) -> Vec<NodeUsage> {
        self.list().into_iter().filter(|u| u.node_id == node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(tunnel_id: &str, bytes: u64, generation: u64, age_secs: i64) -> UsageSample {
        UsageSample {
            tunnel_id: tunnel_id.to_string(),
            bytes_used: bytes,
            sampled_at: Utc::now() - Duration::seconds(age_secs),
            generation,
        }
    }

    #[test]
    fn test_keeps_latest_per_tunnel() {
        let ledger = UsageLedger::new();
        assert_eq!(ledger.record("n1", vec![sample("t1", 100, 1, 60), sample("t2", 5, 1, 60)]), 2);
        assert_eq!(ledger.record("n1", vec![sample("t1", 250, 1, 0)]), 1);

        assert_eq!(ledger.get("n1", "t1").unwrap().bytes_used, 250);
        assert_eq!(ledger.list().len(), 2);
        assert!(ledger.for_node("n2").is_empty());
    }

    #[test]
    fn test_stale_and_invalid_samples_ignored() {
        let ledger = UsageLedger::new();
        ledger.record("n1", vec![sample("t1", 500, 2, 0)]);

        // Older generation, then a lower value in the same generation
        assert_eq!(ledger.record("n1", vec![sample("t1", 900, 1, 0)]), 0);
        assert_eq!(ledger.record("n1", vec![sample("t1", 400, 2, 0)]), 0);
        assert_eq!(ledger.record("n1", vec![sample("../x", 1, 1, 0)]), 0);
        assert_eq!(ledger.get("n1", "t1").unwrap().bytes_used, 500);
    }

    #[test]
    fn test_new_generation_resets() {
        let ledger = UsageLedger::new();
        ledger.record("n1", vec![sample("t1", 500, 1, 10)]);
        assert_eq!(ledger.record("n1", vec![sample("t1", 3, 2, 0)]), 1);
        assert_eq!(ledger.get("n1", "t1").unwrap().bytes_used, 3);
    }

    #[test]
    fn test_nodes_are_separate() {
        let ledger = UsageLedger::new();
        ledger.record("n2", vec![sample("t1", 7, 1, 0)]);
        ledger.record("n1", vec![sample("t1", 9, 1, 0)]);

        let usage = ledger.list();
        assert_eq!(usage[0].node_id, "n1");
        assert_eq!(usage[1].node_id, "n2");
        assert_eq!(ledger.for_node("n2")[0].bytes_used, 7);
    }
}
