//! # Block Structure
//!
//! A block is what one leader produced during one slot: the transactions it
//! drained from its pool, in PoH order, stamped with the PoH hash the slot
//! ended on and signed by the leader.
//!
//! ## Block Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  BlockHeader                                │
//! │  ├── slot: u64                              │
//! │  ├── hash: [u8; 32]       (BLAKE3 of header)│
//! │  ├── parent_hash: [u8; 32]                  │
//! │  ├── poh_hash: [u8; 32]   (last PoH entry)  │
//! │  ├── leader: PublicKey                      │
//! │  ├── timestamp: u64                         │
//! │  ├── tx_root: [u8; 32]    (Merkle root)     │
//! │  └── signature: Signature                   │
//! ├─────────────────────────────────────────────┤
//! │  transactions: Vec<Transaction>             │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The hash covers `slot ‖ parent_hash ‖ poh_hash ‖ leader ‖ timestamp ‖
//! tx_root`. The signature is over the hash and is not part of it.
//!
//! Blocks travel as `bincode` bytes: that is what turbine shreds and what
//! the legacy BLOCK message carries. Bincode is compact and deterministic;
//! JSON stays out of the consensus path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MAX_BLOCK_BYTES;
use crate::crypto::{
    domain_separated_hash, merkle_root, signer, Hash, PublicKey, Signature, Signer, ZERO_HASH,
};
use crate::transaction::{Transaction, TransactionError};

const BLOCK_HASH_CONTEXT: &str = "quasar 2026-01-01 block header v1";

/// Block-level validation failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BlockError {
    #[error("block hash mismatch at slot {slot}")]
    HashMismatch { slot: u64 },

    #[error("tx_root mismatch at slot {slot}")]
    TxRootMismatch { slot: u64 },

    #[error("block signature is invalid (slot {slot})")]
    SignatureInvalid { slot: u64 },

    #[error("transaction {index} in block is invalid: {source}")]
    InvalidTransaction {
        index: usize,
        #[source]
        source: TransactionError,
    },

    #[error("block at slot {slot} is {size} bytes encoded, more than the {max} byte limit")]
    TooLarge { slot: u64, size: usize, max: usize },

    #[error("block encoding failed: {0}")]
    Encoding(String),
}

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// Everything except the transaction list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// The slot this block was produced in. Genesis is slot 0.
    pub slot: u64,
    /// BLAKE3 (domain-separated) hash of the header fields.
    pub hash: Hash,
    /// Hash of the parent block. All zeros for genesis.
    pub parent_hash: Hash,
    /// Hash of the last PoH entry the leader recorded for this slot.
    pub poh_hash: Hash,
    /// The leader that produced the block.
    pub leader: PublicKey,
    /// Production time, unix milliseconds.
    pub timestamp: u64,
    /// Merkle root over transaction ids.
    pub tx_root: Hash,
    /// Leader's signature over `hash`.
    pub signature: Signature,
}

impl BlockHeader {
    /// Return the block hash as a hex string.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A full block: header plus ordered transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The genesis block. Slot 0, zeroed parent and PoH hash, all-zero
    /// leader key, no transactions, no signature. Identical on every node.
    pub fn genesis() -> Self {
        let leader = PublicKey::from_bytes([0u8; 32]);
        let hash = compute_header_hash(0, &ZERO_HASH, &ZERO_HASH, &leader, 0, &ZERO_HASH);
        Self {
            header: BlockHeader {
                slot: 0,
                hash,
                parent_hash: ZERO_HASH,
                poh_hash: ZERO_HASH,
                leader,
                timestamp: 0,
                tx_root: ZERO_HASH,
                signature: Signature::empty(),
            },
            transactions: Vec::new(),
        }
    }

    /// Build and sign a block on top of `parent_hash`.
    pub fn new_signed(
        slot: u64,
        parent_hash: Hash,
        poh_hash: Hash,
        transactions: Vec<Transaction>,
        leader: &dyn Signer,
        timestamp: u64,
    ) -> Self {
        let leader_key = leader.public_key();
        let tx_root = compute_tx_root(&transactions);
        let hash = compute_header_hash(
            slot,
            &parent_hash,
            &poh_hash,
            &leader_key,
            timestamp,
            &tx_root,
        );
        let signature = leader.sign(&hash);

        Self {
            header: BlockHeader {
                slot,
                hash,
                parent_hash,
                poh_hash,
                leader: leader_key,
                timestamp,
                tx_root,
                signature,
            },
            transactions,
        }
    }

    /// Recompute the header hash from its fields.
    pub fn compute_hash(&self) -> Hash {
        let h = &self.header;
        compute_header_hash(
            h.slot,
            &h.parent_hash,
            &h.poh_hash,
            &h.leader,
            h.timestamp,
            &h.tx_root,
        )
    }

    /// Structural and cryptographic integrity: encoded size, stored hash,
    /// tx_root, every transaction, and the leader signature (genesis excepted).
    ///
    /// Whether the signer was actually the scheduled leader for the slot is
    /// a schedule question and is checked by the node, not here.
    pub fn verify(&self) -> Result<(), BlockError> {
        let slot = self.header.slot;
        let size = self.encoded_len();
        if size > MAX_BLOCK_BYTES {
            return Err(BlockError::TooLarge {
                slot,
                size,
                max: MAX_BLOCK_BYTES,
            });
        }
        if self.header.hash != self.compute_hash() {
            return Err(BlockError::HashMismatch { slot });
        }
        if self.header.tx_root != compute_tx_root(&self.transactions) {
            return Err(BlockError::TxRootMismatch { slot });
        }
        for (index, tx) in self.transactions.iter().enumerate() {
            tx.verify()
                .map_err(|source| BlockError::InvalidTransaction { index, source })?;
        }
        if self.is_genesis() {
            return Ok(());
        }
        if !signer::verify(&self.header.hash, &self.header.signature, &self.header.leader) {
            return Err(BlockError::SignatureInvalid { slot });
        }
        Ok(())
    }

    /// `true` for the canonical genesis block.
    pub fn is_genesis(&self) -> bool {
        self.header.slot == 0 && self.header.parent_hash == ZERO_HASH && self.header.signature.is_empty()
    }

    pub fn slot(&self) -> u64 {
        self.header.slot
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Return the block hash as a hex string.
    pub fn hash_hex(&self) -> String {
        self.header.hash_hex()
    }

    /// Size of [`to_bytes`](Self::to_bytes) without allocating it.
    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map_or(usize::MAX, |n| n as usize)
    }

    /// Serialize for shredding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockError> {
        bincode::serialize(self).map_err(|e| BlockError::Encoding(e.to_string()))
    }

    /// Deserialize reassembled shred bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        bincode::deserialize(bytes).map_err(|e| BlockError::Encoding(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Hash Computation
// ---------------------------------------------------------------------------

fn compute_header_hash(
    slot: u64,
    parent_hash: &Hash,
    poh_hash: &Hash,
    leader: &PublicKey,
    timestamp: u64,
    tx_root: &Hash,
) -> Hash {
    let mut preimage = Vec::with_capacity(8 + 32 * 4 + 8);
    preimage.extend_from_slice(&slot.to_le_bytes());
    preimage.extend_from_slice(parent_hash);
    preimage.extend_from_slice(poh_hash);
    preimage.extend_from_slice(leader.as_bytes());
    preimage.extend_from_slice(&timestamp.to_le_bytes());
    preimage.extend_from_slice(tx_root);
    domain_separated_hash(BLOCK_HASH_CONTEXT, &preimage)
}

/// Merkle root over the transaction ids, in block order.
pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
    let leaves: Vec<Hash> = transactions.iter().map(|tx| tx.id).collect();
    merkle_root(&leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;

    fn leader() -> NodeKeypair {
        NodeKeypair::from_seed(&[1u8; 32])
    }

    fn make_tx(n: u8) -> Transaction {
        Transaction::new_signed(&NodeKeypair::from_seed(&[2u8; 32]), vec![n], n as u64)
    }

    #[test]
    fn genesis_block_properties() {
        let genesis = Block::genesis();
        assert_eq!(genesis.slot(), 0);
        assert_eq!(genesis.header.parent_hash, ZERO_HASH);
        assert!(genesis.is_genesis());
        assert!(genesis.verify().is_ok());
        assert_eq!(genesis.hash(), Block::genesis().hash());
    }

    #[test]
    fn signed_block_verifies() {
        let genesis = Block::genesis();
        let block = Block::new_signed(
            1,
            genesis.hash(),
            [7u8; 32],
            vec![make_tx(1), make_tx(2)],
            &leader(),
            1_000,
        );
        assert_eq!(block.verify(), Ok(()));
        assert_eq!(block.header.leader, leader().public_key());
        assert!(!block.is_genesis());
    }

    #[test]
    fn tampered_hash_fails_verification() {
        let mut block = Block::new_signed(1, ZERO_HASH, ZERO_HASH, vec![], &leader(), 1);
        block.header.hash[0] ^= 0xFF;
        assert_eq!(block.verify(), Err(BlockError::HashMismatch { slot: 1 }));
    }

    #[test]
    fn tampered_tx_list_fails_verification() {
        let mut block = Block::new_signed(3, ZERO_HASH, ZERO_HASH, vec![make_tx(1)], &leader(), 1);
        block.transactions.push(make_tx(2));
        assert_eq!(block.verify(), Err(BlockError::TxRootMismatch { slot: 3 }));
    }

    #[test]
    fn foreign_signature_fails_verification() {
        let mut block = Block::new_signed(4, ZERO_HASH, ZERO_HASH, vec![], &leader(), 1);
        block.header.signature = NodeKeypair::generate().sign(&block.header.hash);
        assert_eq!(block.verify(), Err(BlockError::SignatureInvalid { slot: 4 }));
    }

    #[test]
    fn bincode_roundtrip() {
        let block = Block::new_signed(9, ZERO_HASH, [3u8; 32], vec![make_tx(5)], &leader(), 42);
        let bytes = block.to_bytes().unwrap();
        assert_eq!(Block::from_bytes(&bytes).unwrap(), block);
        assert!(Block::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn encoded_len_matches_bytes() {
        let block = Block::new_signed(2, ZERO_HASH, [3u8; 32], vec![make_tx(1), make_tx(9)], &leader(), 7);
        assert_eq!(block.encoded_len(), block.to_bytes().unwrap().len());
    }

    #[test]
    fn oversized_block_fails_verification() {
        let big = Transaction::new_signed(
            &NodeKeypair::from_seed(&[2u8; 32]),
            vec![0xAB; crate::config::MAX_TX_PAYLOAD_BYTES],
            1,
        );
        let count = MAX_BLOCK_BYTES / big.encoded_len() + 1;
        let block = Block::new_signed(5, ZERO_HASH, ZERO_HASH, vec![big; count], &leader(), 1);
        assert!(matches!(
            block.verify(),
            Err(BlockError::TooLarge { slot: 5, max: MAX_BLOCK_BYTES, .. })
        ));
    }
}
