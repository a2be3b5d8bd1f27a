//! # Protocol Configuration & Constants
//!
//! Every magic number in QUASAR lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! The second half of the file is [`NodeConfig`], the one struct an operator
//! actually edits. It aggregates the per-component configs (each defined
//! next to the component that consumes it) so the node binary can load a
//! single TOML file and hand every service its slice.
//!
//! Timing constants are the cluster's DNA. Every node in a permissioned
//! cluster must agree on slot duration, epoch length and genesis time, or
//! they will compute different leaders for the same wall-clock instant and
//! spend the rest of the day shouting at each other.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::poh::PohConfig;
use crate::consensus::registry::RegistryConfig;
use crate::consensus::schedule::ScheduleConfig;
use crate::consensus::selector::SelectorConfig;
use crate::network::gossip::GossipConfig;
use crate::network::gulf_stream::GulfStreamConfig;
use crate::network::mempool::MempoolConfig;
use crate::network::turbine::TurbineConfig;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate-level protocol version string.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire protocol version carried in every envelope. Peers speaking a
/// different version are dropped at decode time; there is no negotiation.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Magic prefix for the TCP framing. Lets a listener reject non-QUASAR
/// traffic before allocating a buffer for it.
pub const PROTOCOL_MAGIC: u32 = 0x5153_4152; // "QSAR"

// ---------------------------------------------------------------------------
// Slots & Epochs
// ---------------------------------------------------------------------------

/// Cluster genesis, 2026-01-01T00:00:00Z in unix milliseconds. Slot 0
/// starts here. Override it per cluster in the config file, never per node.
pub const GENESIS_UNIX_MS: u64 = 1_767_225_600_000;

/// One leader, one slot, two seconds. Long enough for a block to be
/// produced, shredded and fanned out on commodity links.
pub const DEFAULT_SLOT_DURATION_MS: u64 = 2_000;

/// Slots per epoch. The leader schedule is recomputed once per epoch, so
/// this is also how long a bad ranking can hurt (two minutes).
pub const DEFAULT_SLOTS_PER_EPOCH: u64 = 60;

/// How many upcoming leaders (beyond the current one) gulf stream forwards
/// to. Three upcoming plus the current leader makes four targets.
pub const DEFAULT_MAX_FORWARDING_SLOTS: usize = 3;

/// PoH tick interval. Twenty ticks per default slot.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

// ---------------------------------------------------------------------------
// Leader Selection
// ---------------------------------------------------------------------------

/// Annealing iteration budget per selection round.
pub const ANNEALING_ITERATIONS: u64 = 5_000;

/// Wall-clock budget for one selection round. Overrunning it drops the
/// round to a plain weighted sort and flags the schedule as degraded.
pub const SELECTION_TIME_BUDGET: Duration = Duration::from_millis(500);

/// Nodes not heard from for this long are marked stale and leave the
/// candidate set (they keep their record, in case they come back).
pub const NODE_STALE_AFTER_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Transactions & Blocks
// ---------------------------------------------------------------------------

/// Maximum transaction payload. The consensus core does not interpret
/// payloads, it just refuses to carry novels.
pub const MAX_TX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Upper bound on transactions a leader drains into one block.
pub const MAX_TXS_PER_BLOCK: usize = 4_096;

/// Largest encoded block, header included. Leaves 64 KiB of headroom under
/// [`MAX_MESSAGE_SIZE`] so any block fits in one BLOCK_DATA or BLOCKCHAIN
/// envelope.
pub const MAX_BLOCK_BYTES: usize = MAX_MESSAGE_SIZE - 64 * 1024;

/// Bytes a leader keeps back for the block header and list framing when it
/// sizes the transaction drain.
pub const BLOCK_HEADER_RESERVE_BYTES: usize = 512;

/// How long a gulf stream forwarding record suppresses re-sends of the
/// same transaction to the same leader.
pub const DEFAULT_FORWARD_TTL_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Turbine
// ---------------------------------------------------------------------------

/// Data bytes per shred. The last shred of a block is zero-padded to this
/// size and carries its real length separately.
pub const DEFAULT_SHRED_PAYLOAD_SIZE: usize = 1_024;

/// Hard cap on a shred payload, whatever the config says.
pub const MAX_SHRED_PAYLOAD_SIZE: usize = 64 * 1024;

/// Hard cap on shreds per block. 32k shreds of 1 KiB is a 32 MiB block,
/// which is already absurd.
pub const MAX_SHREDS_PER_BLOCK: u32 = 32_768;

/// Children per turbine tree node.
pub const DEFAULT_TURBINE_FANOUT: usize = 4;

/// Incomplete shred buffers older than this are purged and trigger a
/// chain-sync request.
pub const SHRED_REASSEMBLY_TIMEOUT_MS: u64 = 10_000;

/// Maximum blocks being reassembled at once.
pub const MAX_PENDING_SHRED_BLOCKS: usize = 256;

// ---------------------------------------------------------------------------
// Gossip & Network
// ---------------------------------------------------------------------------

/// Push/pull round interval.
pub const DEFAULT_GOSSIP_INTERVAL_MS: u64 = 1_000;

/// Peers a push round targets.
pub const GOSSIP_PUSH_FANOUT: usize = 6;

/// A peer that has not answered anything for this long fails the round.
pub const PEER_LIVENESS_TIMEOUT_MS: u64 = 3_000;

/// Consecutive failed rounds before a peer is demoted.
pub const PEER_FAILURE_THRESHOLD: u32 = 3;

/// Sliding window for envelope deduplication.
pub const MESSAGE_DEDUP_WINDOW_MS: u64 = 300_000;

/// Largest envelope we will decode. Anything bigger is either a bug or an
/// attack, and we don't care which.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Concurrent outbound sends allowed per node.
pub const MAX_INFLIGHT_SENDS: usize = 256;

/// Blocks returned per BLOCKCHAIN response. The response is also capped at
/// [`MAX_BLOCK_BYTES`] of encoded blocks; the requester pages through the rest.
pub const BLOCKCHAIN_RESPONSE_LIMIT: usize = 512;

/// Default P2P listening port.
pub const DEFAULT_P2P_PORT: u16 = 8901;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 8902;

// ---------------------------------------------------------------------------
// Node Configuration
// ---------------------------------------------------------------------------

/// Errors produced by [`NodeConfig::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Transport-level settings. Everything that isn't consensus but still
/// decides whether two nodes can talk to each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address this node listens on and advertises in its contact info.
    pub listen_addr: String,
    /// Addresses contacted with DISCOVERY on startup.
    pub bootstrap_peers: Vec<String>,
    /// Semaphore budget for concurrent outbound sends.
    pub max_inflight_sends: usize,
    /// Envelope dedup window, in milliseconds.
    pub dedup_window_ms: u64,
    /// Envelopes larger than this are rejected before decoding.
    pub max_message_size: usize,
    /// Connect + write timeout for a single send.
    pub send_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("127.0.0.1:{}", DEFAULT_P2P_PORT),
            bootstrap_peers: Vec::new(),
            max_inflight_sends: MAX_INFLIGHT_SENDS,
            dedup_window_ms: MESSAGE_DEDUP_WINDOW_MS,
            max_message_size: MAX_MESSAGE_SIZE,
            send_timeout_ms: 2_000,
        }
    }
}

/// The complete configuration of one consensus node.
///
/// Every section is optional in the TOML file: missing sections and fields
/// fall back to the defaults in this module.
///
/// ```
/// use quasar_protocol::config::NodeConfig;
///
/// let config = NodeConfig::default();
/// assert!(config.validate().is_ok());
/// assert_eq!(config.schedule.max_forwarding_slots, 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node id. Defaults to the base58 public key.
    pub node_id: Option<String>,
    pub network: NetworkConfig,
    pub registry: RegistryConfig,
    pub selector: SelectorConfig,
    pub schedule: ScheduleConfig,
    pub poh: PohConfig,
    pub gulf_stream: GulfStreamConfig,
    pub turbine: TurbineConfig,
    pub gossip: GossipConfig,
    pub mempool: MempoolConfig,
}

impl NodeConfig {
    /// Sanity-check the whole config. Called by the node binary after all
    /// overrides are applied, and by [`ConsensusNode::new`] as a last line.
    ///
    /// [`ConsensusNode::new`]: crate::network::node::ConsensusNode::new
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.node_id {
            if id.trim().is_empty() {
                return Err(ConfigError::invalid("node_id", "must not be blank"));
            }
        }

        // Slots & epochs
        if self.schedule.slot_duration_ms == 0 {
            return Err(ConfigError::invalid("schedule.slot_duration_ms", "must be > 0"));
        }
        if self.schedule.slots_per_epoch == 0 {
            return Err(ConfigError::invalid("schedule.slots_per_epoch", "must be > 0"));
        }
        if self.poh.tick_interval_ms == 0 || self.poh.tick_interval_ms > self.schedule.slot_duration_ms {
            return Err(ConfigError::invalid(
                "poh.tick_interval_ms",
                "must be > 0 and no longer than a slot",
            ));
        }

        // Selector
        let s = &self.selector;
        for (field, w) in [
            ("selector.uptime_weight", s.uptime_weight),
            ("selector.latency_weight", s.latency_weight),
            ("selector.throughput_weight", s.throughput_weight),
            ("selector.reliability_weight", s.reliability_weight),
            ("selector.diversity_weight", s.diversity_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::invalid(field, "weights must be finite and >= 0"));
            }
        }
        if !(s.initial_temperature.is_finite() && s.initial_temperature > 0.0) {
            return Err(ConfigError::invalid("selector.initial_temperature", "must be > 0"));
        }
        if !(s.cooling_rate > 0.0 && s.cooling_rate < 1.0) {
            return Err(ConfigError::invalid("selector.cooling_rate", "must be in (0, 1)"));
        }
        if !(s.min_temperature > 0.0 && s.min_temperature <= s.initial_temperature) {
            return Err(ConfigError::invalid(
                "selector.min_temperature",
                "must be > 0 and <= initial_temperature",
            ));
        }

        // Turbine
        if self.turbine.fanout == 0 {
            return Err(ConfigError::invalid("turbine.fanout", "must be >= 1"));
        }
        if self.turbine.shred_payload_size < 64
            || self.turbine.shred_payload_size > MAX_SHRED_PAYLOAD_SIZE
        {
            return Err(ConfigError::invalid(
                "turbine.shred_payload_size",
                format!("must be within 64..={}", MAX_SHRED_PAYLOAD_SIZE),
            ));
        }

        // Gossip & network
        if self.gossip.interval_ms == 0 {
            return Err(ConfigError::invalid("gossip.interval_ms", "must be > 0"));
        }
        if self.gossip.push_fanout == 0 {
            return Err(ConfigError::invalid("gossip.push_fanout", "must be >= 1"));
        }
        if self.gossip.max_failed_rounds == 0 {
            return Err(ConfigError::invalid("gossip.max_failed_rounds", "must be >= 1"));
        }
        if self.network.max_inflight_sends == 0 {
            return Err(ConfigError::invalid("network.max_inflight_sends", "must be >= 1"));
        }
        if self.network.send_timeout_ms == 0 {
            return Err(ConfigError::invalid("network.send_timeout_ms", "must be > 0"));
        }
        if self.network.listen_addr.trim().is_empty() {
            return Err(ConfigError::invalid("network.listen_addr", "must not be empty"));
        }
        if self.mempool.max_size == 0 {
            return Err(ConfigError::invalid("mempool.max_size", "must be >= 1"));
        }

        Ok(())
    }
}
