//! Chain storage.
//!
//! The consensus core hands accepted blocks to a [`ChainStore`] and asks it
//! a handful of questions (tip, is this block known, what did slot N
//! produce). Persistence is the store's business; the in-memory
//! implementation here is what the tests and the node binary use.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use thiserror::Error;

use super::block::{Block, BlockError};
use crate::crypto::{short_hex, Hash};

/// Reasons a block is refused by the chain.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChainError {
    #[error("block already in chain: {0}")]
    Duplicate(String),

    #[error("parent {parent} is not the chain tip {tip}")]
    ParentMismatch { parent: String, tip: String },

    #[error("slot {slot} does not advance past tip slot {tip_slot}")]
    SlotNotIncreasing { slot: u64, tip_slot: u64 },

    #[error("invalid block: {0}")]
    InvalidBlock(#[from] BlockError),
}

/// Collaborator interface for chain storage.
pub trait ChainStore: Send + Sync {
    /// Validate `block` against the tip and append it.
    fn append_block(&self, block: Block) -> Result<(), ChainError>;

    /// The current tip. Always at least genesis.
    fn tip(&self) -> Block;

    /// Number of blocks, genesis included.
    fn height(&self) -> u64;

    /// Is a block with this hash in the chain?
    fn contains(&self, hash: &Hash) -> bool;

    /// Look a block up by hash.
    fn get(&self, hash: &Hash) -> Option<Block>;

    /// The block produced in `slot`, if any.
    fn block_at_slot(&self, slot: u64) -> Option<Block>;

    /// Up to `limit` blocks with slot >= `from_slot`, ascending.
    fn blocks_from_slot(&self, from_slot: u64, limit: usize) -> Vec<Block>;
}

#[derive(Debug)]
struct ChainInner {
    blocks: Vec<Block>,
    by_hash: HashMap<Hash, usize>,
    by_slot: BTreeMap<u64, usize>,
}

/// Ordered chain of validated blocks, held in memory.
#[derive(Debug)]
pub struct InMemoryChain {
    inner: RwLock<ChainInner>,
}

impl InMemoryChain {
    /// A chain holding only genesis.
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash(), 0);
        let mut by_slot = BTreeMap::new();
        by_slot.insert(0, 0);
        Self {
            inner: RwLock::new(ChainInner {
                blocks: vec![genesis],
                by_hash,
                by_slot,
            }),
        }
    }
}

impl Default for InMemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for InMemoryChain {
    fn append_block(&self, block: Block) -> Result<(), ChainError> {
        block.verify()?;

        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(&block.hash()) {
            return Err(ChainError::Duplicate(block.hash_hex()));
        }

        // `blocks` always holds genesis, so `last` cannot be empty here.
        let (tip_hash, tip_slot) = match inner.blocks.last() {
            Some(tip) => (tip.hash(), tip.slot()),
            None => (crate::crypto::ZERO_HASH, 0),
        };
        if block.header.parent_hash != tip_hash {
            return Err(ChainError::ParentMismatch {
                parent: short_hex(&block.header.parent_hash),
                tip: short_hex(&tip_hash),
            });
        }
        if block.slot() <= tip_slot {
            return Err(ChainError::SlotNotIncreasing {
                slot: block.slot(),
                tip_slot,
            });
        }

        let index = inner.blocks.len();
        inner.by_hash.insert(block.hash(), index);
        inner.by_slot.insert(block.slot(), index);
        inner.blocks.push(block);
        Ok(())
    }

    fn tip(&self) -> Block {
        let inner = self.inner.read();
        inner.blocks.last().cloned().unwrap_or_else(Block::genesis)
    }

    fn height(&self) -> u64 {
        self.inner.read().blocks.len() as u64
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    fn get(&self, hash: &Hash) -> Option<Block> {
        let inner = self.inner.read();
        inner.by_hash.get(hash).map(|&i| inner.blocks[i].clone())
    }

    fn block_at_slot(&self, slot: u64) -> Option<Block> {
        let inner = self.inner.read();
        inner.by_slot.get(&slot).map(|&i| inner.blocks[i].clone())
    }

    fn blocks_from_slot(&self, from_slot: u64, limit: usize) -> Vec<Block> {
        let inner = self.inner.read();
        inner
            .by_slot
            .range(from_slot..)
            .take(limit)
            .map(|(_, &i)| inner.blocks[i].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;

    fn next_block(chain: &InMemoryChain, slot: u64) -> Block {
        let kp = NodeKeypair::from_seed(&[4u8; 32]);
        Block::new_signed(slot, chain.tip().hash(), [slot as u8; 32], vec![], &kp, slot)
    }

    #[test]
    fn starts_at_genesis() {
        let chain = InMemoryChain::new();
        assert_eq!(chain.height(), 1);
        assert!(chain.tip().is_genesis());
        assert!(chain.block_at_slot(0).is_some());
    }

    #[test]
    fn appends_linked_blocks() {
        let chain = InMemoryChain::new();
        let b1 = next_block(&chain, 1);
        chain.append_block(b1.clone()).unwrap();
        let b3 = next_block(&chain, 3);
        chain.append_block(b3.clone()).unwrap();

        assert_eq!(chain.height(), 3);
        assert_eq!(chain.tip(), b3);
        assert!(chain.contains(&b1.hash()));
        assert_eq!(chain.block_at_slot(3), Some(b3));
        assert!(chain.block_at_slot(2).is_none());
        assert_eq!(chain.blocks_from_slot(1, 10).len(), 2);
        assert_eq!(chain.blocks_from_slot(0, 1).len(), 1);
    }

    #[test]
    fn rejects_duplicates_and_forks() {
        let chain = InMemoryChain::new();
        let b1 = next_block(&chain, 1);
        chain.append_block(b1.clone()).unwrap();
        assert!(matches!(chain.append_block(b1), Err(ChainError::Duplicate(_))));

        let orphan = Block::new_signed(
            5,
            [9u8; 32],
            [0u8; 32],
            vec![],
            &NodeKeypair::from_seed(&[4u8; 32]),
            5,
        );
        assert!(matches!(
            chain.append_block(orphan),
            Err(ChainError::ParentMismatch { .. })
        ));
    }

    #[test]
    fn rejects_non_increasing_slot() {
        let chain = InMemoryChain::new();
        chain.append_block(next_block(&chain, 4)).unwrap();
        assert!(matches!(
            chain.append_block(next_block(&chain, 4)),
            Err(ChainError::SlotNotIncreasing { slot: 4, tip_slot: 4 })
        ));
    }
}
