//! # Turbine
//!
//! Block propagation over a bounded-fanout tree. The leader shreds its
//! block and sends every shred to its `fanout` children; each child
//! forwards what it receives to its own children, and so on. With fanout F
//! a block reaches N nodes in about log_F(N) hops while no node sends more
//! than F copies of anything.
//!
//! ## The tree
//!
//! Every node derives the same tree independently from the block hash and
//! the peer list:
//!
//! ```text
//! order = [leader] ++ sort(peers \ leader, by BLAKE3(block_hash ‖ node_id))
//! children(order[p]) = order[p*F + 1 ..= p*F + F]
//! ```
//!
//! Hashing with the block hash reshuffles the tree per block, so no node is
//! stuck as an interior relay for every block.
//!
//! ## Receiving
//!
//! Shreds are buffered by block hash until all `total` distinct indices
//! have arrived, in any order, then reassembled. Duplicates (same block and
//! index, or a block already finished) are dropped before anything else
//! happens. Buffers that sit incomplete longer than
//! `reassembly_timeout_ms` are purged; the node answers that with a chain
//! sync request.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::message::{MessageKind, Outbound};
use super::shred::{Shred, ShredCodec, ShredError};
use crate::config::{
    DEFAULT_SHRED_PAYLOAD_SIZE, DEFAULT_TURBINE_FANOUT, MAX_PENDING_SHRED_BLOCKS,
    SHRED_REASSEMBLY_TIMEOUT_MS,
};
use crate::consensus::clock::Clock;
use crate::consensus::registry::NodeId;
use crate::crypto::{blake3_hash_multi, short_hex, Hash};
use crate::events::{ConsensusEvent, EventBus};
use crate::storage::Block;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurbineConfig {
    pub shred_payload_size: usize,
    /// Children per node in the propagation tree.
    pub fanout: usize,
    pub reassembly_timeout_ms: u64,
    /// Blocks buffered at once; the oldest is dropped beyond this.
    pub max_pending_blocks: usize,
    /// Finished block hashes remembered for duplicate suppression.
    pub max_completed_cache: usize,
}

impl Default for TurbineConfig {
    fn default() -> Self {
        Self {
            shred_payload_size: DEFAULT_SHRED_PAYLOAD_SIZE,
            fanout: DEFAULT_TURBINE_FANOUT,
            reassembly_timeout_ms: SHRED_REASSEMBLY_TIMEOUT_MS,
            max_pending_blocks: MAX_PENDING_SHRED_BLOCKS,
            max_completed_cache: 4_096,
        }
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// Position order of the propagation tree for one block. `leader` is the
/// root whether or not it appears in `peers`.
pub fn tree_order(block_hash: &Hash, leader: &str, peers: &[NodeId]) -> Vec<NodeId> {
    let mut ranked: Vec<(Hash, &NodeId)> = peers
        .iter()
        .filter(|id| id.as_str() != leader)
        .map(|id| (blake3_hash_multi(&[&block_hash[..], id.as_bytes()]), id))
        .collect();
    ranked.sort();
    ranked.dedup_by(|a, b| a.1 == b.1);

    let mut order = Vec::with_capacity(ranked.len() + 1);
    order.push(leader.to_string());
    order.extend(ranked.into_iter().map(|(_, id)| id.clone()));
    order
}

/// The nodes `node` relays to. Empty if `node` is a leaf or not in `order`.
pub fn children<'a>(order: &'a [NodeId], node: &str, fanout: usize) -> &'a [NodeId] {
    let Some(position) = order.iter().position(|id| id == node) else {
        return &[];
    };
    let start = position.saturating_mul(fanout).saturating_add(1);
    if fanout == 0 || start >= order.len() {
        return &[];
    }
    let end = start.saturating_add(fanout).min(order.len());
    &order[start..end]
}

// ---------------------------------------------------------------------------
// Disseminator
// ---------------------------------------------------------------------------

/// What the leader sends for a new block.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub shreds: Vec<Shred>,
    pub sends: Vec<Outbound>,
}

/// What happened to one received shred.
#[derive(Debug, Default)]
pub struct ShredReceipt {
    /// Copies for our children in the tree.
    pub retransmit: Vec<Outbound>,
    /// Set when this shred completed its block.
    pub completed: Option<Block>,
    /// Set when this shred completed the set but the bytes did not rebuild
    /// into the announced block. The buffer is gone; the block has to come
    /// through sync.
    pub failed: Option<ShredError>,
    pub duplicate: bool,
}

/// An incomplete buffer dropped by [`TurbineDisseminator::purge_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredBlock {
    pub block_hash: Hash,
    pub slot: u64,
    pub received: usize,
    pub total: u32,
}

#[derive(Debug)]
struct ShredBuffer {
    slot: u64,
    total: u32,
    shreds: BTreeMap<u32, Shred>,
    first_seen_ms: u64,
}

#[derive(Debug, Default)]
struct TurbineState {
    pending: HashMap<Hash, ShredBuffer>,
    completed: HashSet<Hash>,
    completed_order: VecDeque<Hash>,
}

impl TurbineState {
    fn mark_completed(&mut self, hash: Hash, cap: usize) {
        if self.completed.insert(hash) {
            self.completed_order.push_back(hash);
        }
        while self.completed_order.len() > cap.max(1) {
            if let Some(old) = self.completed_order.pop_front() {
                self.completed.remove(&old);
            }
        }
    }
}

pub struct TurbineDisseminator {
    config: TurbineConfig,
    codec: ShredCodec,
    node_id: NodeId,
    clock: Arc<dyn Clock>,
    events: EventBus,
    state: Mutex<TurbineState>,
    shreds_received: AtomicU64,
}

impl TurbineDisseminator {
    pub fn new(config: TurbineConfig, node_id: NodeId, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        let codec = ShredCodec::new(config.shred_payload_size);
        Self {
            config,
            codec,
            node_id,
            clock,
            events,
            state: Mutex::new(TurbineState::default()),
            shreds_received: AtomicU64::new(0),
        }
    }

    pub fn codec(&self) -> &ShredCodec {
        &self.codec
    }

    /// Shred a block we lead and address every shred to our children.
    /// `peers` is the `(node_id, address)` list the tree is built from.
    pub fn prepare_broadcast(
        &self,
        block: &Block,
        peers: &[(NodeId, String)],
    ) -> Result<Broadcast, ShredError> {
        let shreds = self.codec.split(block)?;
        let sends = self.fan_out(&block.hash(), &self.node_id, peers, &shreds);
        self.state
            .lock()
            .mark_completed(block.hash(), self.config.max_completed_cache);

        debug!(
            slot = block.slot(),
            block = %short_hex(&block.hash()),
            shreds = shreds.len(),
            sends = sends.len(),
            "prepared turbine broadcast"
        );
        Ok(Broadcast { shreds, sends })
    }

    /// Take one shred off the wire. `leader` is the scheduled leader of the
    /// shred's slot, if the schedule knows it; without it we still buffer
    /// but cannot place ourselves in the tree to relay.
    pub fn on_shred(
        &self,
        shred: Shred,
        leader: Option<&str>,
        peers: &[(NodeId, String)],
    ) -> Result<ShredReceipt, ShredError> {
        shred.validate()?;
        self.shreds_received.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_ms();
        let block_hash = shred.block_hash;

        let complete = {
            let mut state = self.state.lock();
            if state.completed.contains(&block_hash) {
                return Ok(ShredReceipt {
                    duplicate: true,
                    ..Default::default()
                });
            }

            if !state.pending.contains_key(&block_hash) {
                if state.pending.len() >= self.config.max_pending_blocks.max(1) {
                    evict_oldest(&mut state.pending);
                }
                state.pending.insert(
                    block_hash,
                    ShredBuffer {
                        slot: shred.slot,
                        total: shred.total_shred_count,
                        shreds: BTreeMap::new(),
                        first_seen_ms: now,
                    },
                );
            }
            let Some(buffer) = state.pending.get_mut(&block_hash) else {
                return Ok(ShredReceipt::default());
            };
            if buffer.total != shred.total_shred_count || buffer.slot != shred.slot {
                return Err(ShredError::Inconsistent {
                    block: short_hex(&block_hash),
                    field: "total_shred_count",
                });
            }
            if buffer.shreds.contains_key(&shred.index) {
                return Ok(ShredReceipt {
                    duplicate: true,
                    ..Default::default()
                });
            }
            buffer.shreds.insert(shred.index, shred.clone());

            if buffer.shreds.len() == buffer.total as usize {
                state.pending.remove(&block_hash)
            } else {
                None
            }
        };

        let retransmit = match leader {
            Some(leader) if leader != self.node_id => {
                self.fan_out(&block_hash, leader, peers, std::slice::from_ref(&shred))
            }
            _ => Vec::new(),
        };

        let mut receipt = ShredReceipt {
            retransmit,
            ..Default::default()
        };
        let Some(buffer) = complete else {
            return Ok(receipt);
        };
        let shreds: Vec<Shred> = buffer.shreds.into_values().collect();
        match self.codec.reconstruct(&shreds) {
            Ok(block) => {
                self.state
                    .lock()
                    .mark_completed(block_hash, self.config.max_completed_cache);
                info!(
                    slot = block.slot(),
                    block = %short_hex(&block_hash),
                    shreds = shreds.len(),
                    "reassembled block from shreds"
                );
                receipt.completed = Some(block);
            }
            Err(e) => {
                warn!(
                    slot = buffer.slot,
                    block = %short_hex(&block_hash),
                    error = %e,
                    "complete shred set did not reassemble"
                );
                receipt.failed = Some(e);
            }
        }
        Ok(receipt)
    }

    /// Drop buffers that have waited too long. Each one is reported so the
    /// caller can fall back to chain sync.
    pub fn purge_expired(&self) -> Vec<ExpiredBlock> {
        let now = self.clock.now_ms();
        let timeout = self.config.reassembly_timeout_ms;
        let expired: Vec<ExpiredBlock> = {
            let mut state = self.state.lock();
            let stale: Vec<Hash> = state
                .pending
                .iter()
                .filter(|(_, b)| now.saturating_sub(b.first_seen_ms) > timeout)
                .map(|(hash, _)| *hash)
                .collect();
            stale
                .into_iter()
                .filter_map(|hash| {
                    state.pending.remove(&hash).map(|b| ExpiredBlock {
                        block_hash: hash,
                        slot: b.slot,
                        received: b.shreds.len(),
                        total: b.total,
                    })
                })
                .collect()
        };

        for block in &expired {
            warn!(
                block = %short_hex(&block.block_hash),
                slot = block.slot,
                received = block.received,
                total = block.total,
                "shred reassembly timed out"
            );
            self.events.emit(ConsensusEvent::ShredTimeout {
                block_hash: hex::encode(block.block_hash),
                received: block.received,
                total: block.total,
            });
        }
        expired
    }

    /// Valid shreds taken off the wire, duplicates included.
    pub fn shreds_received(&self) -> u64 {
        self.shreds_received.load(Ordering::Relaxed)
    }

    pub fn pending_blocks(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_completed(&self, block_hash: &Hash) -> bool {
        self.state.lock().completed.contains(block_hash)
    }

    /// Record a block that arrived some other way (sync), so late shreds
    /// for it are dropped as duplicates.
    pub fn mark_completed(&self, block_hash: Hash) {
        let mut state = self.state.lock();
        state.pending.remove(&block_hash);
        state.mark_completed(block_hash, self.config.max_completed_cache);
    }

    fn fan_out(
        &self,
        block_hash: &Hash,
        leader: &str,
        peers: &[(NodeId, String)],
        shreds: &[Shred],
    ) -> Vec<Outbound> {
        let ids: Vec<NodeId> = peers.iter().map(|(id, _)| id.clone()).collect();
        let order = tree_order(block_hash, leader, &ids);
        let addresses: HashMap<&str, &str> = peers
            .iter()
            .map(|(id, addr)| (id.as_str(), addr.as_str()))
            .collect();

        let mut sends = Vec::new();
        for child in children(&order, &self.node_id, self.config.fanout) {
            let Some(address) = addresses.get(child.as_str()) else {
                continue;
            };
            for shred in shreds {
                sends.push(Outbound::new(
                    child.clone(),
                    address.to_string(),
                    MessageKind::Shred(shred.clone()),
                ));
            }
        }
        sends
    }
}

fn evict_oldest(pending: &mut HashMap<Hash, ShredBuffer>) {
    let oldest = pending
        .iter()
        .min_by_key(|(hash, b)| (b.first_seen_ms, **hash))
        .map(|(hash, _)| *hash);
    if let Some(hash) = oldest {
        warn!(block = %short_hex(&hash), "shred buffer full, dropping oldest block");
        pending.remove(&hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::clock::ManualClock;
    use crate::crypto::NodeKeypair;
    use crate::transaction::Transaction;
    use std::collections::BTreeSet;

    fn block() -> Block {
        let leader = NodeKeypair::from_seed(&[1; 32]);
        let sender = NodeKeypair::from_seed(&[2; 32]);
        let txs = (0..6)
            .map(|i| Transaction::new_signed(&sender, vec![i; 300], i as u64))
            .collect();
        Block::new_signed(3, Block::genesis().hash(), [9; 32], txs, &leader, 1)
    }

    fn peers(n: usize) -> Vec<(NodeId, String)> {
        (0..n)
            .map(|i| (format!("n{i:02}"), format!("mem://n{i:02}")))
            .collect()
    }

    fn disseminator(node: &str, config: TurbineConfig) -> (TurbineDisseminator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (
            TurbineDisseminator::new(config, node.into(), clock.clone(), EventBus::default()),
            clock,
        )
    }

    #[test]
    fn tree_is_deterministic_and_rooted_at_leader() {
        let ids: Vec<NodeId> = peers(20).into_iter().map(|(id, _)| id).collect();
        let mut reversed = ids.clone();
        reversed.reverse();
        let a = tree_order(&[5; 32], "n07", &ids);
        let b = tree_order(&[5; 32], "n07", &reversed);
        assert_eq!(a, b);
        assert_eq!(a[0], "n07");
        assert_eq!(a.len(), 20);
        assert_ne!(a, tree_order(&[6; 32], "n07", &ids));
    }

    #[test]
    fn every_node_has_exactly_one_parent() {
        let ids: Vec<NodeId> = peers(30).into_iter().map(|(id, _)| id).collect();
        let order = tree_order(&[1; 32], "n00", &ids);
        let mut reached = BTreeSet::new();
        for node in &order {
            let kids = children(&order, node, 4);
            assert!(kids.len() <= 4);
            for kid in kids {
                assert!(reached.insert(kid.clone()), "{kid} has two parents");
            }
        }
        assert_eq!(reached.len(), 29);
        assert!(!reached.contains("n00"));
    }

    #[test]
    fn children_edge_cases() {
        let order: Vec<NodeId> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(children(&order, "a", 4), &order[1..]);
        assert!(children(&order, "c", 4).is_empty());
        assert!(children(&order, "zzz", 4).is_empty());
        assert!(children(&order, "a", 0).is_empty());
    }

    #[test]
    fn leader_sends_every_shred_to_each_child() {
        let (leader, _) = disseminator("n00", TurbineConfig {
            shred_payload_size: 512,
            fanout: 3,
            ..TurbineConfig::default()
        });
        let b = block();
        let broadcast = leader.prepare_broadcast(&b, &peers(10)).unwrap();
        let kids: BTreeSet<_> = broadcast.sends.iter().map(|o| o.target.clone()).collect();
        assert_eq!(kids.len(), 3);
        assert_eq!(broadcast.sends.len(), 3 * broadcast.shreds.len());
        assert!(leader.is_completed(&b.hash()));
    }

    #[test]
    fn out_of_order_with_redelivery_reconstructs() {
        let b = block();
        let codec = ShredCodec::new(b.to_bytes().unwrap().len().div_ceil(10));
        let shreds = codec.split(&b).unwrap();
        assert_eq!(shreds.len(), 10);

        let (node, _) = disseminator("n05", TurbineConfig {
            shred_payload_size: codec.payload_size(),
            ..TurbineConfig::default()
        });
        let peers = peers(8);

        // Shreds 3 and 7 are "dropped" first time round.
        let mut delivered = None;
        for shred in shreds.iter().rev().filter(|s| s.index != 3 && s.index != 7) {
            let receipt = node.on_shred(shred.clone(), Some("n00"), &peers).unwrap();
            assert!(receipt.completed.is_none());
        }
        assert_eq!(node.pending_blocks(), 1);
        for idx in [7, 3] {
            let receipt = node.on_shred(shreds[idx].clone(), Some("n00"), &peers).unwrap();
            if receipt.completed.is_some() {
                delivered = receipt.completed;
            }
        }
        assert_eq!(delivered, Some(b));
        assert_eq!(node.pending_blocks(), 0);

        // Late copies are duplicates.
        let late = node.on_shred(shreds[0].clone(), Some("n00"), &peers).unwrap();
        assert!(late.duplicate);
        assert!(late.retransmit.is_empty());
    }

    #[test]
    fn duplicate_index_is_not_retransmitted_twice() {
        let b = block();
        let (node, _) = disseminator("n01", TurbineConfig {
            shred_payload_size: 256,
            fanout: 2,
            ..TurbineConfig::default()
        });
        let shreds = node.codec().split(&b).unwrap();
        let peers = peers(12);
        let first = node.on_shred(shreds[0].clone(), Some("n00"), &peers).unwrap();
        let again = node.on_shred(shreds[0].clone(), Some("n00"), &peers).unwrap();
        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert!(again.retransmit.is_empty());

        let order = tree_order(&b.hash(), "n00", &peers.iter().map(|p| p.0.clone()).collect::<Vec<_>>());
        assert_eq!(first.retransmit.len(), children(&order, "n01", 2).len());
    }

    #[test]
    fn inconsistent_total_is_rejected() {
        let b = block();
        let (node, _) = disseminator("n01", TurbineConfig {
            shred_payload_size: 256,
            ..TurbineConfig::default()
        });
        let shreds = node.codec().split(&b).unwrap();
        node.on_shred(shreds[0].clone(), None, &[]).unwrap();
        let mut odd = shreds[1].clone();
        odd.total_shred_count += 1;
        assert!(matches!(
            node.on_shred(odd, None, &[]),
            Err(ShredError::Inconsistent { .. })
        ));
    }

    #[test]
    fn incomplete_buffers_time_out() {
        let b = block();
        let (node, clock) = disseminator("n01", TurbineConfig {
            shred_payload_size: 256,
            reassembly_timeout_ms: 1_000,
            ..TurbineConfig::default()
        });
        let mut events = node.events.subscribe();
        let shreds = node.codec().split(&b).unwrap();
        node.on_shred(shreds[0].clone(), None, &[]).unwrap();

        clock.advance(500);
        assert!(node.purge_expired().is_empty());
        clock.advance(600);
        let expired = node.purge_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].slot, 3);
        assert_eq!(expired[0].received, 1);
        assert_eq!(node.pending_blocks(), 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            ConsensusEvent::ShredTimeout { received: 1, .. }
        ));
    }

    #[test]
    fn buffer_cap_drops_oldest() {
        let (node, clock) = disseminator("n01", TurbineConfig {
            shred_payload_size: 64,
            max_pending_blocks: 2,
            ..TurbineConfig::default()
        });
        let leader = NodeKeypair::from_seed(&[1; 32]);
        for slot in 1..=3u64 {
            let b = Block::new_signed(slot, [0; 32], [0; 32], vec![], &leader, slot);
            let first = node.codec().split(&b).unwrap().remove(0);
            node.on_shred(first, None, &[]).unwrap();
            clock.advance(1);
        }
        assert_eq!(node.pending_blocks(), 2);
    }

    #[test]
    fn corrupt_shred_set_still_relays_and_reports() {
        let b = block();
        let (node, _) = disseminator("n01", TurbineConfig {
            shred_payload_size: 256,
            fanout: 2,
            ..TurbineConfig::default()
        });
        let mut shreds = node.codec().split(&b).unwrap();
        let last = shreds.len() - 1;
        // Byte 8 onwards is the stored block hash.
        shreds[0].payload[8] ^= 0xFF;
        let peers = peers(12);
        let order = tree_order(&b.hash(), "n00", &peers.iter().map(|p| p.0.clone()).collect::<Vec<_>>());
        let relays = children(&order, "n01", 2).len();

        for shred in &shreds[..last] {
            let receipt = node.on_shred(shred.clone(), Some("n00"), &peers).unwrap();
            assert!(receipt.failed.is_none());
        }
        let receipt = node.on_shred(shreds[last].clone(), Some("n00"), &peers).unwrap();
        assert!(receipt.completed.is_none());
        assert!(receipt.failed.is_some());
        assert_eq!(receipt.retransmit.len(), relays);
        assert_eq!(node.pending_blocks(), 0);
        assert!(!node.is_completed(&b.hash()));
    }
}
