//! # Wire Messages
//!
//! Everything that crosses the transport is an [`Envelope`]: protocol
//! version, sender identity, the sender's reply address, a timestamp, and a
//! closed [`MessageKind`]. Envelopes are bincode-encoded; the transport
//! frames them, this module only deals in byte slices.
//!
//! ## Inventory vs legacy
//!
//! Data moves through INV/GETDATA: announce ids, let the receiver ask for
//! what it lacks, answer with `Tx`/`BlockData`. The older `Transaction` and
//! `Block` variants (full objects, unsolicited) are still accepted from
//! peers that speak them, but the receiver feeds them into exactly the same
//! admission path. There is one way in for a transaction, however it
//! arrived.
//!
//! ## Deduplication
//!
//! Receivers drop an envelope whose message id they have already seen in
//! the last `dedup_window_ms` (five minutes by default). The id hashes the
//! sender, the timestamp and the encoded kind, so a replay of the same
//! bytes is dropped while a fresh ping or a new gossip round is not.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use super::gossip::{ContactInfo, CrdsDigestItem, CrdsEntry};
use super::shred::Shred;
use crate::config::{MAX_MESSAGE_SIZE, MESSAGE_DEDUP_WINDOW_MS, WIRE_PROTOCOL_VERSION};
use crate::consensus::registry::NodeId;
use crate::crypto::{blake3_hash_multi, Hash};
use crate::storage::Block;
use crate::transaction::Transaction;

/// Upper bound on dedup entries before the oldest quarter is evicted.
const MAX_DEDUP_ENTRIES: usize = 200_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("unsupported wire protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// What an inventory item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryKind {
    Tx,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub hash: Hash,
}

impl InventoryItem {
    pub fn tx(hash: Hash) -> Self {
        Self {
            kind: InventoryKind::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash) -> Self {
        Self {
            kind: InventoryKind::Block,
            hash,
        }
    }
}

/// Every message type on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageKind {
    /// "Here I am": contact info sent to bootstrap peers.
    Discovery(ContactInfo),
    /// Legacy full transaction.
    Transaction(Transaction),
    /// Legacy full block.
    Block(Block),
    /// Chain sync: ask for blocks with `slot >= from_slot`.
    BlockchainRequest { from_slot: u64 },
    Blockchain { blocks: Vec<Block> },
    Inv { items: Vec<InventoryItem> },
    GetData { items: Vec<InventoryItem> },
    /// Bincode-encoded [`Transaction`], in answer to GETDATA.
    Tx { payload: Vec<u8> },
    /// Bincode-encoded [`Block`], in answer to GETDATA.
    BlockData { payload: Vec<u8> },
    Ping { nonce: u64, sent_at: u64 },
    Pong { nonce: u64, sent_at: u64 },
    Push { entries: Vec<CrdsEntry> },
    PullRequest { digest: Vec<CrdsDigestItem> },
    PullResponse { entries: Vec<CrdsEntry> },
    /// "Stop pushing these origins to me."
    Prune { origins: Vec<NodeId> },
    Shred(Shred),
}

impl MessageKind {
    /// Short name for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovery(_) => "discovery",
            Self::Transaction(_) => "transaction",
            Self::Block(_) => "block",
            Self::BlockchainRequest { .. } => "blockchain_request",
            Self::Blockchain { .. } => "blockchain",
            Self::Inv { .. } => "inv",
            Self::GetData { .. } => "getdata",
            Self::Tx { .. } => "tx",
            Self::BlockData { .. } => "block_data",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Push { .. } => "push",
            Self::PullRequest { .. } => "pull_request",
            Self::PullResponse { .. } => "pull_response",
            Self::Prune { .. } => "prune",
            Self::Shred(_) => "shred",
        }
    }
}

/// A message plus the metadata every message carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub sender: NodeId,
    /// Where the sender accepts inbound traffic.
    pub reply_to: String,
    /// Sender's wall clock, unix ms.
    pub timestamp: u64,
    pub kind: MessageKind,
}

impl Envelope {
    pub fn new(sender: NodeId, reply_to: String, timestamp: u64, kind: MessageKind) -> Self {
        Self {
            version: WIRE_PROTOCOL_VERSION,
            sender,
            reply_to,
            timestamp,
            kind,
        }
    }

    /// Content-derived id used for deduplication.
    pub fn message_id(&self) -> Hash {
        let kind = bincode::serialize(&self.kind).unwrap_or_default();
        blake3_hash_multi(&[
            self.sender.as_bytes(),
            &self.timestamp.to_le_bytes(),
            &kind,
        ])
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let bytes =
            bincode::serialize(self).map_err(|e| MessageError::Malformed(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Decode and check the version. Closed enums mean an unknown kind
    /// fails here rather than somewhere downstream.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let envelope: Envelope =
            bincode::deserialize(bytes).map_err(|e| MessageError::Malformed(e.to_string()))?;
        if envelope.version != WIRE_PROTOCOL_VERSION {
            return Err(MessageError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}

/// A message some component wants sent. Components decide *what* goes
/// where; the node runtime does the sending.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: NodeId,
    pub address: String,
    pub kind: MessageKind,
}

impl Outbound {
    pub fn new(target: NodeId, address: String, kind: MessageKind) -> Self {
        Self {
            target,
            address,
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

/// Sliding-window set of recently seen message ids.
pub struct MessageDeduplicator {
    seen: DashMap<Hash, u64>,
    window_ms: u64,
    max_entries: usize,
}

impl MessageDeduplicator {
    pub fn new(window_ms: u64) -> Self {
        Self {
            seen: DashMap::new(),
            window_ms,
            max_entries: MAX_DEDUP_ENTRIES,
        }
    }

    /// `true` the first time an id is seen within the window.
    pub fn check_and_insert(&self, id: Hash, now_ms: u64) -> bool {
        let mut fresh = true;
        self.seen
            .entry(id)
            .and_modify(|seen_at| {
                if now_ms.saturating_sub(*seen_at) <= self.window_ms {
                    fresh = false;
                } else {
                    *seen_at = now_ms;
                }
            })
            .or_insert(now_ms);
        if fresh {
            self.maybe_evict();
        } else {
            trace!(id = %hex::encode(&id[..8]), "dropping duplicate message");
        }
        fresh
    }

    /// Drop ids older than the window.
    pub fn purge(&self, now_ms: u64) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| now_ms.saturating_sub(*seen_at) <= self.window_ms);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Over capacity: keep the newest 75%.
    fn maybe_evict(&self) {
        if self.seen.len() <= self.max_entries {
            return;
        }
        let target = self.max_entries * 3 / 4;
        let mut entries: Vec<(Hash, u64)> = self
            .seen
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_by_key(|(_, ts)| *ts);
        let to_remove = entries.len().saturating_sub(target);
        for (id, _) in entries.iter().take(to_remove) {
            self.seen.remove(id);
        }
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(MESSAGE_DEDUP_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(sender: &str, ts: u64) -> Envelope {
        Envelope::new(
            sender.into(),
            "mem://a".into(),
            ts,
            MessageKind::Ping { nonce: 7, sent_at: ts },
        )
    }

    #[test]
    fn encode_decode_preserves_envelope() {
        let env = Envelope::new(
            "n1".into(),
            "127.0.0.1:8901".into(),
            42,
            MessageKind::Inv {
                items: vec![InventoryItem::tx([1; 32]), InventoryItem::block([2; 32])],
            },
        );
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.kind.name(), "inv");
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut env = ping("n1", 1);
        env.version = WIRE_PROTOCOL_VERSION + 1;
        let bytes = bincode::serialize(&env).unwrap();
        assert_eq!(
            Envelope::decode(&bytes),
            Err(MessageError::UnsupportedVersion(WIRE_PROTOCOL_VERSION + 1))
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            Envelope::decode(&[0xde, 0xad, 0xbe, 0xef]),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn message_id_depends_on_sender_and_time() {
        assert_eq!(ping("a", 1).message_id(), ping("a", 1).message_id());
        assert_ne!(ping("a", 1).message_id(), ping("b", 1).message_id());
        assert_ne!(ping("a", 1).message_id(), ping("a", 2).message_id());
    }

    #[test]
    fn dedup_window_slides() {
        let dedup = MessageDeduplicator::new(1_000);
        let id = ping("a", 1).message_id();
        assert!(dedup.check_and_insert(id, 10_000));
        assert!(!dedup.check_and_insert(id, 10_500));
        assert!(dedup.check_and_insert(id, 11_600));

        assert_eq!(dedup.purge(20_000), 1);
        assert!(dedup.is_empty());
    }

    #[test]
    fn dedup_evicts_oldest_when_full() {
        let dedup = MessageDeduplicator {
            seen: DashMap::new(),
            window_ms: u64::MAX,
            max_entries: 8,
        };
        for i in 0..9u8 {
            dedup.check_and_insert([i; 32], i as u64);
        }
        assert_eq!(dedup.len(), 6);
        // The newest survives, the oldest is gone.
        assert!(!dedup.check_and_insert([8; 32], 100));
        assert!(dedup.check_and_insert([0; 32], 100));
    }
}
