//! # Gossip (CRDS)
//!
//! Cluster state that every node should eventually agree on lives in a
//! small replicated table, the CRDS (cluster replicated data store). Each
//! row is keyed by `(origin, kind)` and holds one signed value: a node's
//! contact info, or the leader schedule it last published.
//!
//! ## Merge rule
//!
//! An incoming entry replaces the stored one iff its wallclock is newer.
//! Equal wallclocks are broken by comparing signature bytes, greater wins,
//! so two nodes that receive the same pair of conflicting entries in
//! opposite orders still end up holding the same one. Everything else is
//! stale and dropped without fuss. Merging the same entry twice is a no-op.
//!
//! ## Propagation
//!
//! - **Push**: every round, a random `push_fanout` subset of healthy peers
//!   gets the entries that changed since we last pushed to that peer.
//! - **Pull**: one random healthy peer gets our digest (key, wallclock,
//!   signature per entry) and answers with whatever we are missing or hold
//!   an older copy of. Pull repairs what push missed.
//! - **Prune**: a peer that keeps pushing us entries we already have is
//!   asked to stop pushing those origins.
//!
//! ## Liveness
//!
//! Each round pings every peer. A peer that leaves `max_failed_rounds`
//! consecutive pings unanswered is demoted: no pushes, no pulls, but its
//! entries stay. One pong brings it back. Probe results feed the registry's
//! `uptime` and `latency_seconds`.
//!
//! Like the rest of the network layer this module does no I/O. Every
//! operation returns the [`Outbound`] messages it wants sent and the node
//! runtime sends them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::message::{MessageKind, Outbound};
use crate::config::{
    DEFAULT_GOSSIP_INTERVAL_MS, GOSSIP_PUSH_FANOUT, PEER_FAILURE_THRESHOLD,
    PEER_LIVENESS_TIMEOUT_MS,
};
use crate::consensus::clock::Clock;
use crate::consensus::registry::{MetricsUpdate, NodeId, NodeRegistry};
use crate::consensus::schedule::{LeaderScheduleTable, SchedulePublisher};
use crate::crypto::{domain_separated_hash, signer, PublicKey, Signature, Signer};
use crate::events::{ConsensusEvent, EventBus};

const CRDS_SIGNING_CONTEXT: &str = "quasar 2026-01-01 crds entry v1";

/// Weight of the newest ping result in the uptime and latency moving averages.
const PROBE_EWMA_ALPHA: f64 = 0.2;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Push/pull/liveness round period.
    pub interval_ms: u64,
    /// Peers pushed to per round.
    pub push_fanout: usize,
    /// A ping older than this without a pong counts as a failed round.
    pub liveness_timeout_ms: u64,
    /// Consecutive failed rounds before a peer is demoted.
    pub max_failed_rounds: u32,
    /// Cap on entries per PUSH or PULL_RESPONSE.
    pub max_entries_per_message: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_GOSSIP_INTERVAL_MS,
            push_fanout: GOSSIP_PUSH_FANOUT,
            liveness_timeout_ms: PEER_LIVENESS_TIMEOUT_MS,
            max_failed_rounds: PEER_FAILURE_THRESHOLD,
            max_entries_per_message: 256,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GossipError {
    /// Not newer than what we hold. Expected and harmless.
    #[error("stale gossip entry from {origin}")]
    StaleEntry { origin: NodeId },

    #[error("gossip entry from {origin} has an invalid signature")]
    SignatureInvalid { origin: NodeId },

    #[error("malformed gossip entry from {origin}: {reason}")]
    Malformed { origin: NodeId, reason: String },
}

// ---------------------------------------------------------------------------
// CRDS values
// ---------------------------------------------------------------------------

/// How to reach a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CrdsKind {
    ContactInfo,
    LeaderSchedule,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CrdsKey {
    pub origin: NodeId,
    pub kind: CrdsKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdsValue {
    ContactInfo(ContactInfo),
    LeaderSchedule(LeaderScheduleTable),
}

impl CrdsValue {
    pub fn kind(&self) -> CrdsKind {
        match self {
            Self::ContactInfo(_) => CrdsKind::ContactInfo,
            Self::LeaderSchedule(_) => CrdsKind::LeaderSchedule,
        }
    }
}

/// A signed CRDS row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdsEntry {
    pub origin: NodeId,
    pub origin_key: PublicKey,
    pub value: CrdsValue,
    /// Origin's clock at publication, unix ms.
    pub wallclock: u64,
    pub signature: Signature,
}

impl CrdsEntry {
    pub fn new_signed(
        origin: NodeId,
        signer: &dyn Signer,
        value: CrdsValue,
        wallclock: u64,
    ) -> Self {
        let origin_key = signer.public_key();
        let digest = signing_digest(&origin, &origin_key, &value, wallclock);
        let signature = signer.sign(&digest);
        Self {
            origin,
            origin_key,
            value,
            wallclock,
            signature,
        }
    }

    pub fn key(&self) -> CrdsKey {
        CrdsKey {
            origin: self.origin.clone(),
            kind: self.value.kind(),
        }
    }

    /// Signature check plus the structural rule that contact info can only
    /// describe its own origin.
    pub fn verify(&self) -> Result<(), GossipError> {
        if let CrdsValue::ContactInfo(info) = &self.value {
            if info.node_id != self.origin || info.public_key != self.origin_key {
                return Err(GossipError::Malformed {
                    origin: self.origin.clone(),
                    reason: "contact info does not describe its origin".into(),
                });
            }
        }
        let digest = signing_digest(&self.origin, &self.origin_key, &self.value, self.wallclock);
        if !signer::verify(&digest, &self.signature, &self.origin_key) {
            return Err(GossipError::SignatureInvalid {
                origin: self.origin.clone(),
            });
        }
        Ok(())
    }

    /// Merge rule: newer wallclock, then greater signature.
    pub fn supersedes(&self, other: &CrdsEntry) -> bool {
        (self.wallclock, &self.signature) > (other.wallclock, &other.signature)
    }

    pub fn digest_item(&self) -> CrdsDigestItem {
        CrdsDigestItem {
            key: self.key(),
            wallclock: self.wallclock,
            signature: self.signature.clone(),
        }
    }
}

fn signing_digest(
    origin: &str,
    origin_key: &PublicKey,
    value: &CrdsValue,
    wallclock: u64,
) -> [u8; 32] {
    // Strings, integers and byte arrays: bincode cannot fail on these.
    let value_bytes = bincode::serialize(value).unwrap_or_default();
    let mut preimage = Vec::with_capacity(origin.len() + 48 + value_bytes.len());
    preimage.extend_from_slice(&(origin.len() as u32).to_le_bytes());
    preimage.extend_from_slice(origin.as_bytes());
    preimage.extend_from_slice(origin_key.as_bytes());
    preimage.extend_from_slice(&wallclock.to_le_bytes());
    preimage.extend_from_slice(&value_bytes);
    domain_separated_hash(CRDS_SIGNING_CONTEXT, &preimage)
}

/// What a pull request advertises per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdsDigestItem {
    pub key: CrdsKey,
    pub wallclock: u64,
    pub signature: Signature,
}

// ---------------------------------------------------------------------------
// CRDS table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CrdsRecord {
    entry: CrdsEntry,
    /// Local insertion counter; push watermarks compare against it.
    ordinal: u64,
}

#[derive(Debug, Default)]
struct CrdsInner {
    records: BTreeMap<CrdsKey, CrdsRecord>,
    next_ordinal: u64,
}

/// The replicated table. Knows the merge rule, nothing about peers.
#[derive(Debug, Default)]
pub struct CrdsTable {
    inner: RwLock<CrdsInner>,
}

impl CrdsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the merge rule. The entry is assumed verified.
    pub fn insert(&self, entry: CrdsEntry) -> Result<(), GossipError> {
        let key = entry.key();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.records.get(&key) {
            if !entry.supersedes(&existing.entry) {
                return Err(GossipError::StaleEntry {
                    origin: entry.origin,
                });
            }
        }
        inner.next_ordinal += 1;
        let ordinal = inner.next_ordinal;
        inner.records.insert(key, CrdsRecord { entry, ordinal });
        Ok(())
    }

    pub fn get(&self, key: &CrdsKey) -> Option<CrdsEntry> {
        self.inner.read().records.get(key).map(|r| r.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    pub fn digest(&self) -> Vec<CrdsDigestItem> {
        self.inner
            .read()
            .records
            .values()
            .map(|r| r.entry.digest_item())
            .collect()
    }

    /// Entries inserted after `ordinal`, oldest first, with their ordinals.
    pub fn entries_since(&self, ordinal: u64) -> Vec<(u64, CrdsEntry)> {
        let inner = self.inner.read();
        let mut newer: Vec<&CrdsRecord> = inner
            .records
            .values()
            .filter(|r| r.ordinal > ordinal)
            .collect();
        newer.sort_by_key(|r| r.ordinal);
        newer
            .into_iter()
            .map(|r| (r.ordinal, r.entry.clone()))
            .collect()
    }

    /// Entries the holder of `digest` lacks or holds an older copy of.
    pub fn missing_from(&self, digest: &[CrdsDigestItem]) -> Vec<CrdsEntry> {
        let theirs: HashMap<&CrdsKey, &CrdsDigestItem> =
            digest.iter().map(|item| (&item.key, item)).collect();
        self.inner
            .read()
            .records
            .iter()
            .filter(|(key, record)| match theirs.get(key) {
                None => true,
                Some(item) => {
                    (record.entry.wallclock, &record.entry.signature)
                        > (item.wallclock, &item.signature)
                }
            })
            .map(|(_, record)| record.entry.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<CrdsEntry> {
        self.inner
            .read()
            .records
            .values()
            .map(|r| r.entry.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PeerState {
    address: String,
    consecutive_failures: u32,
    demoted: bool,
    /// Outstanding ping: (nonce, sent_at).
    awaiting: Option<(u64, u64)>,
    /// CRDS ordinal up to which this peer has been pushed.
    pushed_through: u64,
    /// Origins this peer asked us not to push.
    pruned: BTreeSet<NodeId>,
    uptime: f64,
    latency_seconds: Option<f64>,
}

impl PeerState {
    fn new(address: String) -> Self {
        Self {
            address,
            consecutive_failures: 0,
            demoted: false,
            awaiting: None,
            pushed_through: 0,
            pruned: BTreeSet::new(),
            uptime: 0.0,
            latency_seconds: None,
        }
    }
}

/// Peer liveness, as the gossip layer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHealth {
    pub node_id: NodeId,
    pub address: String,
    pub demoted: bool,
    pub consecutive_failures: u32,
    pub uptime: f64,
}

/// Result of merging a batch of entries.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Entries that were new or replaced an older copy. The caller applies
    /// them (registry, schedule).
    pub accepted: Vec<CrdsEntry>,
    pub stale: usize,
    pub rejected: usize,
    /// A PRUNE to send back, if the sender pushed nothing but duplicates.
    pub prune: Option<Outbound>,
}

// ---------------------------------------------------------------------------
// GossipService
// ---------------------------------------------------------------------------

pub struct GossipService {
    config: GossipConfig,
    node_id: NodeId,
    signer: Arc<dyn Signer>,
    address: String,
    table: CrdsTable,
    peers: DashMap<NodeId, PeerState>,
    registry: Arc<NodeRegistry>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    last_wallclock: AtomicU64,
    next_nonce: AtomicU64,
}

impl GossipService {
    pub fn new(
        config: GossipConfig,
        node_id: NodeId,
        signer: Arc<dyn Signer>,
        address: String,
        registry: Arc<NodeRegistry>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            node_id,
            signer,
            address,
            table: CrdsTable::new(),
            peers: DashMap::new(),
            registry,
            clock,
            events,
            last_wallclock: AtomicU64::new(0),
            next_nonce: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn table(&self) -> &CrdsTable {
        &self.table
    }

    pub fn contact_info(&self) -> ContactInfo {
        ContactInfo {
            node_id: self.node_id.clone(),
            public_key: self.signer.public_key(),
            address: self.address.clone(),
        }
    }

    // -- publishing --------------------------------------------------------

    /// Sign and insert a value of our own. Wallclocks of our own entries
    /// strictly increase even if the clock does not.
    pub fn publish(&self, value: CrdsValue) -> CrdsEntry {
        let now = self.clock.now_ms();
        let prev = self
            .last_wallclock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let wallclock = now.max(prev + 1);
        let entry = CrdsEntry::new_signed(self.node_id.clone(), self.signer.as_ref(), value, wallclock);
        if let Err(e) = self.table.insert(entry.clone()) {
            // Only possible if someone else forged a newer entry for us.
            warn!(error = %e, "own gossip entry was not accepted");
        }
        entry
    }

    pub fn publish_contact_info(&self) -> CrdsEntry {
        self.publish(CrdsValue::ContactInfo(self.contact_info()))
    }

    // -- peers -------------------------------------------------------------

    /// Start gossiping with a peer. Refreshes the address of a known one.
    pub fn add_peer(&self, node_id: &str, address: &str) -> bool {
        if node_id == self.node_id || address.is_empty() {
            return false;
        }
        match self.peers.get_mut(node_id) {
            Some(mut peer) => {
                peer.address = address.to_string();
                false
            }
            None => {
                debug!(peer = node_id, address, "added gossip peer");
                self.peers
                    .insert(node_id.to_string(), PeerState::new(address.to_string()));
                true
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Non-demoted peers, `(node_id, address)`, ascending by id.
    pub fn healthy_peers(&self) -> Vec<(NodeId, String)> {
        let mut peers: Vec<(NodeId, String)> = self
            .peers
            .iter()
            .filter(|p| !p.demoted)
            .map(|p| (p.key().clone(), p.address.clone()))
            .collect();
        peers.sort();
        peers
    }

    pub fn peer_health(&self, node_id: &str) -> Option<PeerHealth> {
        self.peers.get(node_id).map(|p| PeerHealth {
            node_id: node_id.to_string(),
            address: p.address.clone(),
            demoted: p.demoted,
            consecutive_failures: p.consecutive_failures,
            uptime: p.uptime,
        })
    }

    // -- rounds ------------------------------------------------------------

    /// Push what changed to a random subset of healthy peers.
    pub fn push_round(&self) -> Vec<Outbound> {
        let mut targets = self.healthy_peers();
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(self.config.push_fanout);

        let mut outbound = Vec::new();
        for (peer_id, address) in targets {
            let Some(mut peer) = self.peers.get_mut(&peer_id) else {
                continue;
            };
            // The watermark only moves past entries this round consumed, so a
            // batch cut short by the message cap resumes where it stopped.
            let mut watermark = peer.pushed_through;
            let mut entries = Vec::new();
            for (ordinal, entry) in self.table.entries_since(peer.pushed_through) {
                if entries.len() >= self.config.max_entries_per_message.max(1) {
                    break;
                }
                watermark = ordinal;
                if entry.origin != peer_id && !peer.pruned.contains(&entry.origin) {
                    entries.push(entry);
                }
            }
            peer.pushed_through = watermark;
            if entries.is_empty() {
                continue;
            }
            trace!(peer = %peer_id, entries = entries.len(), "gossip push");
            outbound.push(Outbound::new(peer_id.clone(), address, MessageKind::Push { entries }));
        }
        outbound
    }

    /// Send our digest to one random healthy peer.
    pub fn pull_round(&self) -> Option<Outbound> {
        let peers = self.healthy_peers();
        let (peer_id, address) = peers.choose(&mut rand::thread_rng())?.clone();
        Some(Outbound::new(
            peer_id,
            address,
            MessageKind::PullRequest {
                digest: self.table.digest(),
            },
        ))
    }

    /// Score outstanding pings, then ping every peer (demoted ones too, so
    /// they can come back).
    pub fn liveness_round(&self) -> Vec<Outbound> {
        let now = self.clock.now_ms();
        let mut outbound = Vec::new();
        let mut demoted = Vec::new();

        for mut peer in self.peers.iter_mut() {
            let peer_id = peer.key().clone();
            if let Some((_, sent_at)) = peer.awaiting {
                if now.saturating_sub(sent_at) < self.config.liveness_timeout_ms {
                    // Still in flight; don't double-ping.
                    continue;
                }
                peer.awaiting = None;
                peer.consecutive_failures += 1;
                peer.uptime *= 1.0 - PROBE_EWMA_ALPHA;
                if !peer.demoted && peer.consecutive_failures >= self.config.max_failed_rounds {
                    peer.demoted = true;
                    demoted.push(peer_id.clone());
                }
                let _ = self.registry.update_metrics(
                    &peer_id,
                    MetricsUpdate {
                        uptime: Some(peer.uptime),
                        ..Default::default()
                    },
                );
            }

            let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
            peer.awaiting = Some((nonce, now));
            outbound.push(Outbound::new(
                peer_id,
                peer.address.clone(),
                MessageKind::Ping { nonce, sent_at: now },
            ));
        }

        for node_id in demoted {
            warn!(peer = %node_id, "peer failed liveness, demoted");
            self.events.emit(ConsensusEvent::PeerDemoted { node_id });
        }
        outbound
    }

    /// A pong arrived. Returns the round-trip time in ms if it answered our
    /// outstanding ping.
    pub fn handle_pong(&self, from: &str, nonce: u64) -> Option<u64> {
        let now = self.clock.now_ms();
        let (rtt_ms, recovered, uptime, latency) = {
            let mut peer = self.peers.get_mut(from)?;
            let (expected, sent_at) = peer.awaiting?;
            if expected != nonce {
                return None;
            }
            let rtt_ms = now.saturating_sub(sent_at);
            peer.awaiting = None;
            peer.consecutive_failures = 0;
            let recovered = std::mem::replace(&mut peer.demoted, false);
            if recovered {
                peer.pruned.clear();
            }
            peer.uptime = peer.uptime * (1.0 - PROBE_EWMA_ALPHA) + PROBE_EWMA_ALPHA;
            let sample = rtt_ms as f64 / 1_000.0;
            let latency = match peer.latency_seconds {
                Some(prev) => prev * (1.0 - PROBE_EWMA_ALPHA) + sample * PROBE_EWMA_ALPHA,
                None => sample,
            };
            peer.latency_seconds = Some(latency);
            (rtt_ms, recovered, peer.uptime, latency)
        };

        let _ = self.registry.update_metrics(
            from,
            MetricsUpdate {
                uptime: Some(uptime),
                latency_seconds: Some(latency),
                last_seen: Some(now),
                ..Default::default()
            },
        );
        if recovered {
            info!(peer = from, "demoted peer answered again");
            self.events.emit(ConsensusEvent::PeerRecovered {
                node_id: from.to_string(),
            });
        }
        Some(rtt_ms)
    }

    // -- inbound -----------------------------------------------------------

    /// Merge a PUSH. Duplicates-only pushes earn the sender a PRUNE.
    pub fn handle_push(&self, from: &str, entries: Vec<CrdsEntry>) -> MergeOutcome {
        let mut outcome = self.merge(from, entries.clone());
        if outcome.accepted.is_empty() && outcome.stale > 0 {
            let origins: BTreeSet<NodeId> = entries
                .into_iter()
                .map(|e| e.origin)
                .filter(|o| o != from && *o != self.node_id)
                .collect();
            if let (false, Some(address)) = (
                origins.is_empty(),
                self.peers.get(from).map(|p| p.address.clone()),
            ) {
                outcome.prune = Some(Outbound::new(
                    from.to_string(),
                    address,
                    MessageKind::Prune {
                        origins: origins.into_iter().collect(),
                    },
                ));
            }
        }
        outcome
    }

    /// Answer a pull request with what the requester lacks.
    pub fn handle_pull_request(&self, digest: &[CrdsDigestItem]) -> Vec<CrdsEntry> {
        let mut missing = self.table.missing_from(digest);
        missing.truncate(self.config.max_entries_per_message);
        missing
    }

    pub fn handle_pull_response(&self, from: &str, entries: Vec<CrdsEntry>) -> MergeOutcome {
        self.merge(from, entries)
    }

    /// Stop pushing `origins` to `from`.
    pub fn handle_prune(&self, from: &str, origins: Vec<NodeId>) {
        if let Some(mut peer) = self.peers.get_mut(from) {
            debug!(peer = from, count = origins.len(), "peer pruned origins");
            peer.pruned.extend(origins);
        }
    }

    fn merge(&self, from: &str, entries: Vec<CrdsEntry>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for entry in entries {
            if let Err(e) = self.check_origin_key(&entry).and_then(|_| entry.verify()) {
                outcome.rejected += 1;
                match e {
                    GossipError::SignatureInvalid { origin } => {
                        warn!(origin = %origin, from, "gossip entry failed signature check");
                        self.events.emit(ConsensusEvent::GossipSignatureInvalid {
                            origin,
                            from: from.to_string(),
                        });
                    }
                    other => debug!(from, error = %other, "dropped malformed gossip entry"),
                }
                continue;
            }
            match self.table.insert(entry.clone()) {
                Ok(()) => outcome.accepted.push(entry),
                Err(_) => outcome.stale += 1,
            }
        }
        if !outcome.accepted.is_empty() {
            self.events.emit(ConsensusEvent::GossipMerged {
                entries: outcome.accepted.len(),
            });
        }
        outcome
    }

    /// A registered node's entries must be signed with its registered key.
    fn check_origin_key(&self, entry: &CrdsEntry) -> Result<(), GossipError> {
        match self.registry.get(&entry.origin) {
            Some(record) if record.public_key != entry.origin_key => {
                Err(GossipError::SignatureInvalid {
                    origin: entry.origin.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl SchedulePublisher for GossipService {
    fn publish_schedule(&self, table: &LeaderScheduleTable) {
        self.publish(CrdsValue::LeaderSchedule(table.clone()));
    }
}
