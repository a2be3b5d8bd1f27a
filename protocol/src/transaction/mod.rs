//! # Transactions
//!
//! The consensus core does not care what a transaction *means*. It cares
//! that a transaction has a stable identity, a sender who signed it, and a
//! bounded size. Interpreting `payload` is the job of whatever sits on top
//! of QUASAR.
//!
//! ## Identity
//!
//! `id = BLAKE3(canonical_bytes)`, where the canonical bytes are
//!
//! ```text
//! sender (32) ‖ timestamp (u64 LE) ‖ payload_len (u32 LE) ‖ payload
//! ```
//!
//! The signature is not part of the canonical bytes (it signs them), so the
//! id is known before signing and two honest nodes always agree on it. The
//! id is what gulf stream deduplicates on, what PoH mixes in, and what INV
//! announces.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MAX_TX_PAYLOAD_BYTES;
use crate::crypto::{blake3_hash, signer, Hash, PublicKey, Signature, Signer};

/// Transaction id: BLAKE3 of the canonical bytes.
pub type TxId = Hash;

/// Reasons a transaction is refused at admission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction signature is invalid")]
    SignatureInvalid,

    #[error("transaction id does not match its content")]
    IdMismatch,

    #[error("transaction payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// A signed, opaque transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// BLAKE3 of [`canonical_bytes`](Self::canonical_bytes).
    pub id: TxId,
    /// Originating node or client key.
    pub sender: PublicKey,
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Creation time, unix milliseconds. Part of the id, so resubmitting the
    /// same payload later produces a different transaction.
    pub timestamp: u64,
    /// Sender's signature over the canonical bytes.
    pub signature: Signature,
}

impl Transaction {
    /// Build and sign a transaction in one go.
    pub fn new_signed(signer: &dyn Signer, payload: Vec<u8>, timestamp: u64) -> Self {
        let sender = signer.public_key();
        let canonical = encode_canonical(&sender, timestamp, &payload);
        let signature = signer.sign(&canonical);
        Self {
            id: blake3_hash(&canonical),
            sender,
            payload,
            timestamp,
            signature,
        }
    }

    /// The bytes the id and the signature are computed over. Also the bytes
    /// PoH mixes into the chain when this transaction is ingested.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        encode_canonical(&self.sender, self.timestamp, &self.payload)
    }

    /// Recompute the id from content.
    pub fn compute_id(&self) -> TxId {
        blake3_hash(&self.canonical_bytes())
    }

    /// Full admission check: size, id integrity, signature.
    pub fn verify(&self) -> Result<(), TransactionError> {
        if self.payload.len() > MAX_TX_PAYLOAD_BYTES {
            return Err(TransactionError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_TX_PAYLOAD_BYTES,
            });
        }
        let canonical = self.canonical_bytes();
        if blake3_hash(&canonical) != self.id {
            return Err(TransactionError::IdMismatch);
        }
        if !signer::verify(&canonical, &self.signature, &self.sender) {
            return Err(TransactionError::SignatureInvalid);
        }
        Ok(())
    }

    /// Bytes this transaction occupies inside an encoded block.
    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map_or(usize::MAX, |n| n as usize)
    }

    /// Hex-encoded id, for logs and metrics labels.
    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
}

fn encode_canonical(sender: &PublicKey, timestamp: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + 8 + 4 + payload.len());
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}
