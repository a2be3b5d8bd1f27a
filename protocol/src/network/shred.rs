//! # Shreds
//!
//! A block is too big to send to every validator from one socket, so it is
//! cut into fixed-size fragments (shreds) that can be relayed
//! independently. Each shred carries enough header to be placed without
//! seeing any other shred:
//!
//! ```text
//! block_hash ‖ slot ‖ index ‖ total_shred_count ‖ is_data ‖ payload_len ‖ payload
//! ```
//!
//! Every payload is exactly `shred_payload_size` bytes on the wire; the last
//! one is zero-padded and `payload_len` says how much of it is real.
//! Reassembly concatenates the real bytes in index order, decodes the
//! block, and checks that its hash is the one every shred claimed.
//!
//! Only data shreds exist today. The flag is on the wire so that erasure
//! coding can be added without a format change; anything with it cleared is
//! rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DEFAULT_SHRED_PAYLOAD_SIZE, MAX_SHREDS_PER_BLOCK, MAX_SHRED_PAYLOAD_SIZE};
use crate::crypto::{short_hex, Hash};
use crate::storage::{Block, BlockError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ShredError {
    #[error("shred index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("shred declares an invalid total of {0}")]
    InvalidTotal(u32),

    #[error("shred payload length {len} is inconsistent with {actual} bytes carried")]
    InvalidPayload { len: u32, actual: usize },

    #[error("coding shreds are not supported")]
    NotDataShred,

    #[error("block {block} needs {count} shreds, more than the limit of {max}")]
    TooManyShreds { block: String, count: usize, max: u32 },

    #[error("shreds for block {block} disagree on {field}")]
    Inconsistent { block: String, field: &'static str },

    #[error("block {block} is missing shreds ({have}/{total})")]
    Incomplete { block: String, have: usize, total: u32 },

    #[error("reassembled block hash {actual} does not match {expected}")]
    BlockHashMismatch { expected: String, actual: String },

    #[error("no shreds given")]
    Empty,

    #[error(transparent)]
    Block(#[from] BlockError),
}

/// One fragment of a serialized block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shred {
    pub block_hash: Hash,
    pub slot: u64,
    pub index: u32,
    pub total_shred_count: u32,
    pub is_data_shred: bool,
    /// Unpadded length of `payload`.
    pub payload_len: u32,
    pub payload: Vec<u8>,
}

impl Shred {
    /// Header sanity checks, run on every shred off the wire.
    pub fn validate(&self) -> Result<(), ShredError> {
        if !self.is_data_shred {
            return Err(ShredError::NotDataShred);
        }
        if self.total_shred_count == 0 || self.total_shred_count > MAX_SHREDS_PER_BLOCK {
            return Err(ShredError::InvalidTotal(self.total_shred_count));
        }
        if self.index >= self.total_shred_count {
            return Err(ShredError::IndexOutOfRange {
                index: self.index,
                total: self.total_shred_count,
            });
        }
        if self.payload.len() > MAX_SHRED_PAYLOAD_SIZE
            || self.payload_len as usize > self.payload.len()
        {
            return Err(ShredError::InvalidPayload {
                len: self.payload_len,
                actual: self.payload.len(),
            });
        }
        Ok(())
    }

    /// The payload without padding.
    pub fn data(&self) -> &[u8] {
        let len = (self.payload_len as usize).min(self.payload.len());
        &self.payload[..len]
    }
}

/// Block ↔ shreds.
#[derive(Debug, Clone, Copy)]
pub struct ShredCodec {
    payload_size: usize,
}

impl ShredCodec {
    /// `payload_size` is clamped to `1..=MAX_SHRED_PAYLOAD_SIZE`.
    pub fn new(payload_size: usize) -> Self {
        Self {
            payload_size: payload_size.clamp(1, MAX_SHRED_PAYLOAD_SIZE),
        }
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Serialize `block` and cut it into data shreds, index order.
    pub fn split(&self, block: &Block) -> Result<Vec<Shred>, ShredError> {
        let bytes = block.to_bytes()?;
        let count = bytes.len().div_ceil(self.payload_size).max(1);
        if count > MAX_SHREDS_PER_BLOCK as usize {
            return Err(ShredError::TooManyShreds {
                block: block.hash_hex(),
                count,
                max: MAX_SHREDS_PER_BLOCK,
            });
        }
        let total = count as u32;

        let shreds = bytes
            .chunks(self.payload_size)
            .enumerate()
            .map(|(index, chunk)| {
                let mut payload = chunk.to_vec();
                payload.resize(self.payload_size, 0);
                Shred {
                    block_hash: block.hash(),
                    slot: block.slot(),
                    index: index as u32,
                    total_shred_count: total,
                    is_data_shred: true,
                    payload_len: chunk.len() as u32,
                    payload,
                }
            })
            .collect();
        Ok(shreds)
    }

    /// Rebuild a block from a complete set of shreds, in any order.
    /// Duplicates are tolerated; gaps are not.
    pub fn reconstruct(&self, shreds: &[Shred]) -> Result<Block, ShredError> {
        let first = shreds.first().ok_or(ShredError::Empty)?;
        let block_hash = first.block_hash;
        let total = first.total_shred_count;
        for shred in shreds {
            shred.validate()?;
            if shred.block_hash != block_hash {
                return Err(inconsistent(&block_hash, "block_hash"));
            }
            if shred.total_shred_count != total {
                return Err(inconsistent(&block_hash, "total_shred_count"));
            }
            if shred.slot != first.slot {
                return Err(inconsistent(&block_hash, "slot"));
            }
        }

        let mut ordered: Vec<&Shred> = shreds.iter().collect();
        ordered.sort_by_key(|s| s.index);
        ordered.dedup_by_key(|s| s.index);
        if ordered.len() != total as usize {
            return Err(ShredError::Incomplete {
                block: short_hex(&block_hash),
                have: ordered.len(),
                total,
            });
        }

        let mut bytes = Vec::with_capacity(ordered.iter().map(|s| s.data().len()).sum());
        for shred in ordered {
            bytes.extend_from_slice(shred.data());
        }
        let block = Block::from_bytes(&bytes)?;
        if block.hash() != block_hash {
            return Err(ShredError::BlockHashMismatch {
                expected: short_hex(&block_hash),
                actual: short_hex(&block.hash()),
            });
        }
        Ok(block)
    }
}

impl Default for ShredCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SHRED_PAYLOAD_SIZE)
    }
}

fn inconsistent(block_hash: &Hash, field: &'static str) -> ShredError {
    ShredError::Inconsistent {
        block: short_hex(block_hash),
        field,
    }
}
