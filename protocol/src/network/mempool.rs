//! Arrival-ordered transaction pool.
//!
//! Every node keeps admitted transactions here until a block containing
//! them is accepted. Non-leaders hold them so they can answer GETDATA from
//! the leaders gulf stream announced them to; the leader drains them into
//! its block.
//!
//! ## Design
//!
//! - `DashMap` keyed by tx id gives concurrent duplicate checks on the hot
//!   inbound path.
//! - A `parking_lot::RwLock<BTreeMap>` keyed by arrival sequence keeps FIFO
//!   order for `drain_for_leader`. There are no fees to rank by; first come,
//!   first sequenced.
//! - Per-sender counts stop a single key from filling the pool.
//! - Entries older than `expiry_ms` are dropped by [`TransactionPool::expire_old`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::consensus::clock::{Clock, SystemClock};
use crate::crypto::{short_hex, PublicKey};
use crate::transaction::{Transaction, TxId};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum number of transactions the pool will hold.
    pub max_size: usize,

    /// Maximum pending transactions per sender key.
    pub max_per_sender: usize,

    /// Milliseconds after which a pending transaction is dropped.
    pub expiry_ms: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_per_sender: 1_000,
            expiry_ms: 10 * 60 * 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionPool
// ---------------------------------------------------------------------------

/// What the consensus core needs from a transaction pool.
pub trait TransactionPool: Send + Sync {
    /// Admit an already-verified transaction.
    fn add(&self, tx: Transaction) -> Result<(), MempoolError>;

    /// Remove and return up to `max` transactions, oldest first, stopping
    /// before the first one that would take the total encoded size past
    /// `max_bytes`.
    fn drain_for_leader(&self, max: usize, max_bytes: usize) -> Vec<Transaction>;

    /// Put back transactions drained for a block that was never produced.
    /// They join the back of the queue; any the pool now refuses are dropped.
    fn requeue(&self, txs: Vec<Transaction>) {
        for tx in txs {
            let id = tx.id;
            match self.add(tx) {
                Ok(()) | Err(MempoolError::DuplicateTransaction) => {}
                Err(e) => debug!(tx = %short_hex(&id), error = %e, "drained transaction not re-queued"),
            }
        }
    }

    /// Drop transactions by id (included in a block). Unknown ids are ignored.
    fn remove(&self, ids: &[TxId]);

    fn contains(&self, id: &TxId) -> bool;

    fn get(&self, id: &TxId) -> Option<Transaction>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop transactions that sat too long. Returns how many went.
    fn expire_old(&self) -> usize {
        0
    }
}

// ---------------------------------------------------------------------------
// MempoolError
// ---------------------------------------------------------------------------

/// Errors returned by mempool operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    /// A transaction with the same id is already in the pool.
    DuplicateTransaction,

    /// The sender already has too many pending transactions.
    SenderLimitExceeded { sender: String, limit: usize },

    /// The pool is at capacity.
    MempoolFull { size: usize },
}

impl fmt::Display for MempoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTransaction => write!(f, "transaction already exists in mempool"),
            Self::SenderLimitExceeded { sender, limit } => {
                write!(f, "sender {} exceeded per-sender limit of {}", sender, limit)
            }
            Self::MempoolFull { size } => {
                write!(f, "mempool is full ({} transactions)", size)
            }
        }
    }
}

impl std::error::Error for MempoolError {}

// ---------------------------------------------------------------------------
// Mempool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MempoolEntry {
    transaction: Transaction,
    added_at: u64,
    sequence: u64,
}

/// The default, in-memory [`TransactionPool`].
pub struct Mempool {
    transactions: DashMap<TxId, MempoolEntry>,
    arrival_index: RwLock<BTreeMap<u64, TxId>>,
    sender_counts: DashMap<PublicKey, usize>,
    next_sequence: AtomicU64,
    clock: Arc<dyn Clock>,
    config: MempoolConfig,
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("size", &self.transactions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Mempool {
    pub fn new(config: MempoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transactions: DashMap::new(),
            arrival_index: RwLock::new(BTreeMap::new()),
            sender_counts: DashMap::new(),
            next_sequence: AtomicU64::new(0),
            clock,
            config,
        }
    }

    /// Pending transaction ids, oldest first.
    pub fn pending_ids(&self) -> Vec<TxId> {
        self.arrival_index.read().values().copied().collect()
    }

    fn remove_one(&self, id: &TxId) -> Option<Transaction> {
        let (_, entry) = self.transactions.remove(id)?;
        self.arrival_index.write().remove(&entry.sequence);
        self.decrement_sender_count(&entry.transaction.sender);
        Some(entry.transaction)
    }

    fn decrement_sender_count(&self, sender: &PublicKey) {
        if let Some(mut count) = self.sender_counts.get_mut(sender) {
            if *count <= 1 {
                drop(count);
                self.sender_counts.remove(sender);
            } else {
                *count -= 1;
            }
        }
    }
}

impl TransactionPool for Mempool {
    fn add(&self, tx: Transaction) -> Result<(), MempoolError> {
        if self.transactions.contains_key(&tx.id) {
            return Err(MempoolError::DuplicateTransaction);
        }

        let sender_count = self.sender_counts.get(&tx.sender).map(|v| *v).unwrap_or(0);
        if sender_count >= self.config.max_per_sender {
            return Err(MempoolError::SenderLimitExceeded {
                sender: tx.sender.to_base58(),
                limit: self.config.max_per_sender,
            });
        }

        if self.transactions.len() >= self.config.max_size {
            return Err(MempoolError::MempoolFull {
                size: self.config.max_size,
            });
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let id = tx.id;
        let sender = tx.sender.clone();
        let entry = MempoolEntry {
            transaction: tx,
            added_at: self.clock.now_ms(),
            sequence,
        };

        // Lost a race with a concurrent add of the same id.
        if self.transactions.insert(id, entry).is_some() {
            return Err(MempoolError::DuplicateTransaction);
        }
        self.arrival_index.write().insert(sequence, id);
        *self.sender_counts.entry(sender).or_insert(0) += 1;
        Ok(())
    }

    fn drain_for_leader(&self, max: usize, max_bytes: usize) -> Vec<Transaction> {
        let ids: Vec<TxId> = self
            .arrival_index
            .read()
            .values()
            .take(max)
            .copied()
            .collect();
        let mut budget = max_bytes;
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            let size = match self.transactions.get(&id) {
                Some(entry) => entry.transaction.encoded_len(),
                None => continue,
            };
            if size > budget {
                break;
            }
            if let Some(tx) = self.remove_one(&id) {
                budget -= size;
                drained.push(tx);
            }
        }
        drained
    }

    fn remove(&self, ids: &[TxId]) {
        for id in ids {
            self.remove_one(id);
        }
    }

    fn contains(&self, id: &TxId) -> bool {
        self.transactions.contains_key(id)
    }

    fn get(&self, id: &TxId) -> Option<Transaction> {
        self.transactions.get(id).map(|e| e.transaction.clone())
    }

    fn expire_old(&self) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(self.config.expiry_ms);
        let expired: Vec<TxId> = self
            .transactions
            .iter()
            .filter(|entry| entry.value().added_at < cutoff)
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            self.remove_one(id);
        }
        expired.len()
    }

    fn len(&self) -> usize {
        self.transactions.len()
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(MempoolConfig::default(), Arc::new(SystemClock))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
