//! # Node Registry
//!
//! The registry is the cluster's scoreboard: one record per known node,
//! holding the performance numbers the leader selector ranks on.
//!
//! Records arrive from two directions. Gossip tells us a node *exists*
//! (contact info: id, key, address). Local pings tell us how well it is
//! *doing* (uptime, latency, throughput, whether it produced its slots).
//! Neither path ever deletes a record; a node that goes quiet is marked
//! stale and sits out of leader selection until it is heard from again.
//!
//! ## Snapshots
//!
//! The selector never reads the live table. It takes a
//! [`RegistrySnapshot`]: an immutable copy of the non-stale records, ordered
//! by node id, with a content hash over exactly the fields that feed the
//! score. Two nodes holding the same metrics produce bit-identical
//! snapshots and therefore bit-identical schedules. `last_seen` and
//! `address` are deliberately excluded from the hash: they differ between
//! observers and would make every snapshot unique.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::NODE_STALE_AFTER_MS;
use crate::crypto::{blake3_hash, Hash, PublicKey};

/// Node identifiers are plain strings: the operator-chosen name, or the
/// base58 public key when none was chosen.
pub type NodeId = String;

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("invalid metric `{field}`: {value}")]
    InvalidMetric { field: &'static str, value: f64 },

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
}

/// Registry tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Nodes unseen for longer than this are marked stale.
    pub stale_after_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: NODE_STALE_AFTER_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeRecord
// ---------------------------------------------------------------------------

/// Everything the cluster knows about one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    /// Transport address from contact info. Empty until gossip learns it.
    pub address: String,
    /// Fraction of liveness pings answered, in [0, 1].
    pub uptime: f64,
    /// Round-trip latency estimate, seconds.
    pub latency_seconds: f64,
    /// Observed transactions per second when leading.
    pub throughput: f64,
    pub proposal_success_count: u64,
    pub proposal_failure_count: u64,
    /// Last time anything was heard from the node, unix ms.
    pub last_seen: u64,
    /// Set by `evict_stale`, cleared on the next sighting.
    pub stale: bool,
}

impl NodeRecord {
    /// A freshly registered node: zeroed metrics.
    pub fn new(node_id: NodeId, public_key: PublicKey) -> Self {
        Self {
            node_id,
            public_key,
            address: String::new(),
            uptime: 0.0,
            latency_seconds: 0.0,
            throughput: 0.0,
            proposal_success_count: 0,
            proposal_failure_count: 0,
            last_seen: 0,
            stale: false,
        }
    }

    /// Share of this node's leader slots that produced no block. Zero for a
    /// node that has never led.
    pub fn failure_ratio(&self) -> f64 {
        let total = self.proposal_success_count + self.proposal_failure_count;
        if total == 0 {
            0.0
        } else {
            self.proposal_failure_count as f64 / total as f64
        }
    }
}

/// A partial metrics update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsUpdate {
    pub uptime: Option<f64>,
    pub latency_seconds: Option<f64>,
    pub throughput: Option<f64>,
    pub last_seen: Option<u64>,
}

// ---------------------------------------------------------------------------
// RegistrySnapshot
// ---------------------------------------------------------------------------

/// Immutable, node-id-ordered copy of the active records.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySnapshot {
    records: Arc<[NodeRecord]>,
    content_hash: Hash,
}

impl RegistrySnapshot {
    /// Build a snapshot from arbitrary records. Sorts by node id; the hash
    /// is computed over the sorted order.
    pub fn from_records(mut records: Vec<NodeRecord>) -> Self {
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let content_hash = hash_records(&records);
        Self {
            records: records.into(),
            content_hash,
        }
    }

    pub fn records(&self) -> &[NodeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// BLAKE3 over the score-relevant fields. Seeds the annealer.
    pub fn content_hash(&self) -> Hash {
        self.content_hash
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeRecord> {
        self.records
            .binary_search_by(|r| r.node_id.as_str().cmp(node_id))
            .ok()
            .map(|i| &self.records[i])
    }
}

fn hash_records(records: &[NodeRecord]) -> Hash {
    let mut buf = Vec::with_capacity(records.len() * 96);
    for r in records {
        buf.extend_from_slice(&(r.node_id.len() as u32).to_le_bytes());
        buf.extend_from_slice(r.node_id.as_bytes());
        buf.extend_from_slice(r.public_key.as_bytes());
        buf.extend_from_slice(&r.uptime.to_bits().to_le_bytes());
        buf.extend_from_slice(&r.latency_seconds.to_bits().to_le_bytes());
        buf.extend_from_slice(&r.throughput.to_bits().to_le_bytes());
        buf.extend_from_slice(&r.proposal_success_count.to_le_bytes());
        buf.extend_from_slice(&r.proposal_failure_count.to_le_bytes());
    }
    blake3_hash(&buf)
}

// ---------------------------------------------------------------------------
// NodeRegistry
// ---------------------------------------------------------------------------

/// The live, lock-protected registry.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
    config: RegistryConfig,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            config,
        }
    }

    /// Insert a node with zeroed metrics. Idempotent: registering a known
    /// id changes nothing and returns `false`.
    pub fn register(&self, node_id: impl Into<NodeId>, public_key: PublicKey) -> bool {
        let node_id = node_id.into();
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node_id) {
            return false;
        }
        debug!(node = %node_id, "registered node");
        nodes.insert(node_id.clone(), NodeRecord::new(node_id, public_key));
        true
    }

    /// Gossip path: create or refresh a node from its contact info. A known
    /// node gets its key and address replaced and its stale flag cleared.
    /// Returns `true` if the node was new.
    pub fn upsert_contact(
        &self,
        node_id: &str,
        public_key: PublicKey,
        address: &str,
        seen_at: u64,
    ) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(node_id) {
            Some(record) => {
                record.public_key = public_key;
                record.address = address.to_string();
                record.last_seen = record.last_seen.max(seen_at);
                record.stale = false;
                false
            }
            None => {
                let mut record = NodeRecord::new(node_id.to_string(), public_key);
                record.address = address.to_string();
                record.last_seen = seen_at;
                info!(node = node_id, address, "discovered node");
                nodes.insert(node_id.to_string(), record);
                true
            }
        }
    }

    /// Merge a partial metrics update.
    ///
    /// Uptime is clamped to [0, 1] (a ping that over-counts is an
    /// accounting bug, not an attack). Negative or non-finite latency or
    /// throughput is rejected outright and nothing is applied.
    pub fn update_metrics(&self, node_id: &str, update: MetricsUpdate) -> Result<(), RegistryError> {
        if let Some(uptime) = update.uptime {
            if !uptime.is_finite() {
                return Err(RegistryError::InvalidMetric {
                    field: "uptime",
                    value: uptime,
                });
            }
        }
        if let Some(latency) = update.latency_seconds {
            if !latency.is_finite() || latency < 0.0 {
                return Err(RegistryError::InvalidMetric {
                    field: "latency_seconds",
                    value: latency,
                });
            }
        }
        if let Some(throughput) = update.throughput {
            if !throughput.is_finite() || throughput < 0.0 {
                return Err(RegistryError::InvalidMetric {
                    field: "throughput",
                    value: throughput,
                });
            }
        }

        let mut nodes = self.nodes.write();
        let record = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;

        if let Some(uptime) = update.uptime {
            record.uptime = uptime.clamp(0.0, 1.0);
        }
        if let Some(latency) = update.latency_seconds {
            record.latency_seconds = latency;
        }
        if let Some(throughput) = update.throughput {
            record.throughput = throughput;
        }
        if let Some(seen) = update.last_seen {
            record.last_seen = record.last_seen.max(seen);
            record.stale = false;
        }
        Ok(())
    }

    /// Note that a node was heard from.
    pub fn touch(&self, node_id: &str, now_ms: u64) {
        if let Some(record) = self.nodes.write().get_mut(node_id) {
            record.last_seen = record.last_seen.max(now_ms);
            record.stale = false;
        }
    }

    /// Count a leader slot as produced (`true`) or missed (`false`).
    pub fn record_proposal(&self, node_id: &str, success: bool) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write();
        let record = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        if success {
            record.proposal_success_count += 1;
        } else {
            record.proposal_failure_count += 1;
        }
        Ok(())
    }

    /// Immutable copy of the active (non-stale) records.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let records = self
            .nodes
            .read()
            .values()
            .filter(|r| !r.stale)
            .cloned()
            .collect();
        RegistrySnapshot::from_records(records)
    }

    /// Mark every node unseen for longer than `max_age_ms` as stale. Returns
    /// the ids newly marked. `exempt` (usually the local node) is never
    /// marked; a node does not go stale to itself.
    pub fn evict_stale(&self, max_age_ms: u64, now_ms: u64, exempt: &str) -> Vec<NodeId> {
        let mut marked = Vec::new();
        for record in self.nodes.write().values_mut() {
            if record.stale || record.node_id == exempt {
                continue;
            }
            if now_ms.saturating_sub(record.last_seen) > max_age_ms {
                record.stale = true;
                marked.push(record.node_id.clone());
            }
        }
        if !marked.is_empty() {
            info!(count = marked.len(), nodes = ?marked, "marked nodes stale");
        }
        marked
    }

    /// `evict_stale` with the configured threshold.
    pub fn evict_stale_default(&self, now_ms: u64, exempt: &str) -> Vec<NodeId> {
        self.evict_stale(self.config.stale_after_ms, now_ms, exempt)
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn address_of(&self, node_id: &str) -> Option<String> {
        self.nodes
            .read()
            .get(node_id)
            .map(|r| r.address.clone())
            .filter(|a| !a.is_empty())
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Ids of non-stale nodes, ascending.
    pub fn active_ids(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .values()
            .filter(|r| !r.stale)
            .map(|r| r.node_id.clone())
            .collect()
    }

    /// `(node_id, address)` for every non-stale node with a known address,
    /// ascending by id. This is the peer list the turbine tree is built from.
    pub fn addressed_peers(&self) -> Vec<(NodeId, String)> {
        self.nodes
            .read()
            .values()
            .filter(|r| !r.stale && !r.address.is_empty())
            .map(|r| (r.node_id.clone(), r.address.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;

    fn key(n: u8) -> PublicKey {
        NodeKeypair::from_seed(&[n; 32]).public_key()
    }

    #[test]
    fn register_is_idempotent() {
        let registry = NodeRegistry::default();
        assert!(registry.register("node1", key(1)));
        registry
            .update_metrics("node1", MetricsUpdate { uptime: Some(0.5), ..Default::default() })
            .unwrap();
        assert!(!registry.register("node1", key(1)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("node1").unwrap().uptime, 0.5);
    }

    #[test]
    fn update_merges_partial_fields() {
        let registry = NodeRegistry::default();
        registry.register("n", key(1));
        registry
            .update_metrics("n", MetricsUpdate { uptime: Some(0.9), ..Default::default() })
            .unwrap();
        registry
            .update_metrics(
                "n",
                MetricsUpdate { latency_seconds: Some(0.2), ..Default::default() },
            )
            .unwrap();
        let r = registry.get("n").unwrap();
        assert_eq!(r.uptime, 0.9);
        assert_eq!(r.latency_seconds, 0.2);
        assert_eq!(r.throughput, 0.0);
    }

    #[test]
    fn uptime_is_clamped() {
        let registry = NodeRegistry::default();
        registry.register("n", key(1));
        registry
            .update_metrics("n", MetricsUpdate { uptime: Some(1.7), ..Default::default() })
            .unwrap();
        assert_eq!(registry.get("n").unwrap().uptime, 1.0);
        registry
            .update_metrics("n", MetricsUpdate { uptime: Some(-3.0), ..Default::default() })
            .unwrap();
        assert_eq!(registry.get("n").unwrap().uptime, 0.0);
    }

    #[test]
    fn invalid_metrics_are_rejected_without_side_effects() {
        let registry = NodeRegistry::default();
        registry.register("n", key(1));

        let err = registry
            .update_metrics(
                "n",
                MetricsUpdate {
                    uptime: Some(0.4),
                    latency_seconds: Some(-1.0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidMetric { field: "latency_seconds", .. }));
        assert_eq!(registry.get("n").unwrap().uptime, 0.0);

        assert!(registry
            .update_metrics("n", MetricsUpdate { throughput: Some(f64::NAN), ..Default::default() })
            .is_err());
        assert!(registry
            .update_metrics("ghost", MetricsUpdate::default())
            .is_err());
    }

    #[test]
    fn snapshot_is_ordered_and_excludes_stale() {
        let registry = NodeRegistry::default();
        registry.register("c", key(3));
        registry.register("a", key(1));
        registry.register("b", key(2));
        registry.touch("a", 10_000);
        registry.touch("c", 10_000);

        let marked = registry.evict_stale(5_000, 12_000, "nobody");
        assert_eq!(marked, vec!["b".to_string()]);
        assert_eq!(registry.len(), 3, "stale nodes are kept");

        let snap = registry.snapshot();
        let ids: Vec<&str> = snap.records().iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(snap.get("b").is_none());

        // Heard from again: back in the candidate set.
        registry.touch("b", 13_000);
        assert_eq!(registry.snapshot().len(), 3);
    }

    #[test]
    fn exempt_node_never_goes_stale() {
        let registry = NodeRegistry::default();
        registry.register("me", key(1));
        assert!(registry.evict_stale(1, 1_000_000, "me").is_empty());
    }

    #[test]
    fn snapshot_hash_ignores_observer_local_fields() {
        let a = NodeRegistry::default();
        let b = NodeRegistry::default();
        a.upsert_contact("x", key(1), "10.0.0.1:1", 5);
        b.upsert_contact("x", key(1), "10.0.0.9:9", 99);
        assert_eq!(a.snapshot().content_hash(), b.snapshot().content_hash());

        b.record_proposal("x", true).unwrap();
        assert_ne!(a.snapshot().content_hash(), b.snapshot().content_hash());
    }

    #[test]
    fn upsert_contact_refreshes_address() {
        let registry = NodeRegistry::default();
        assert!(registry.upsert_contact("p", key(5), "127.0.0.1:1", 1));
        assert!(!registry.upsert_contact("p", key(5), "127.0.0.1:2", 2));
        assert_eq!(registry.address_of("p").as_deref(), Some("127.0.0.1:2"));
        assert_eq!(registry.addressed_peers().len(), 1);
    }

    #[test]
    fn failure_ratio_tracks_proposals() {
        let registry = NodeRegistry::default();
        registry.register("l", key(1));
        registry.record_proposal("l", true).unwrap();
        registry.record_proposal("l", false).unwrap();
        registry.record_proposal("l", false).unwrap();
        let r = registry.get("l").unwrap();
        assert!((r.failure_ratio() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(NodeRecord::new("z".into(), key(2)).failure_ratio(), 0.0);
    }
}
