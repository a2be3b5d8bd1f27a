//! # Consensus Events
//!
//! Local failures in QUASAR never take the process down. An unreachable
//! leader, a block that never finished reassembling, a forged gossip entry:
//! each one is logged where it happens and then published here, on a
//! `tokio::sync::broadcast` channel, for whoever cares. The node binary's
//! metrics task cares a lot; tests care about specific variants; nobody
//! else has to care at all.
//!
//! Publishing with no subscribers is fine. Lagging subscribers lose the
//! oldest events, which is the right trade for a telemetry stream.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::consensus::registry::NodeId;

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Something noteworthy happened inside the consensus pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConsensusEvent {
    /// The wall-clock slot moved forward.
    SlotAdvanced {
        slot: u64,
        epoch: u64,
        leader: Option<NodeId>,
    },
    /// A locally computed leader schedule was published.
    SchedulePublished {
        epoch: u64,
        distinct_leaders: usize,
        degraded: bool,
    },
    /// A gossiped schedule replaced (or preceded) the local one.
    ScheduleAdopted { epoch: u64, origin: NodeId },
    /// Schedule computation failed; the prior table stays active.
    ScheduleFailed { epoch: u64, reason: String },
    /// Annealing overran its budget and fell back to the weighted sort.
    SelectionTimeout {
        epoch: u64,
        budget_ms: u64,
        elapsed_ms: u64,
    },
    /// A transaction went out to upcoming leaders.
    TransactionForwarded { tx_id: String, targets: usize },
    /// A forwarding target could not be reached; retried next slot.
    ForwardUnreachable {
        tx_id: String,
        target: NodeId,
        reason: String,
    },
    /// This node produced a block as leader.
    BlockProduced {
        slot: u64,
        hash: String,
        transactions: usize,
        shreds: usize,
    },
    /// A block arrived (via shreds or sync) and was appended.
    BlockAccepted { slot: u64, hash: String },
    /// A block was rejected by validation.
    BlockRejected { slot: u64, reason: String },
    /// Shreds were sent or retransmitted.
    ShredsSent { count: usize },
    /// A shred buffer timed out before completing.
    ShredTimeout { block_hash: String, received: usize, total: u32 },
    /// A gossip entry failed signature verification.
    GossipSignatureInvalid { origin: NodeId, from: NodeId },
    /// New or replaced CRDS entries were merged.
    GossipMerged { entries: usize },
    /// A peer failed too many liveness rounds.
    PeerDemoted { node_id: NodeId },
    /// A previously demoted peer answered again.
    PeerRecovered { node_id: NodeId },
    /// PoH chain verification failed. Fatal.
    PohCorrupted { index: u64 },
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConsensusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ConsensusEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
