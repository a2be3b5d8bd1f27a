//! # Proof of History
//!
//! A hash chain used as a clock. Every entry hashes the previous one, so
//! the chain can only be produced in order and anyone holding it can check
//! that order after the fact:
//!
//! ```text
//! tick entry:         hash[n] = SHA-256(hash[n-1])
//! transaction entry:  hash[n] = SHA-256(hash[n-1] ‖ tx.canonical_bytes())
//! ```
//!
//! Ticks are rate-limited to one per `tick_interval_ms`; transactions are
//! mixed in as they are ingested. The leader cuts the entries of its slot
//! into a block and stamps the block with the last hash.
//!
//! SHA-256 here, BLAKE3 everywhere else: PoH is the one place where the
//! hash function is part of the observable chain format, and SHA-256 has
//! the hardware support to make sequential hashing cheap.
//!
//! The sequencer is single-writer. All mutation goes through one
//! `parking_lot::Mutex`; readers take the same lock briefly and copy out.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, trace};

use super::clock::Clock;
use crate::config::DEFAULT_TICK_INTERVAL_MS;
use crate::crypto::{sha256, sha256_multi, Hash};
use crate::transaction::{Transaction, TxId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PohError {
    /// A link does not recompute. Fatal: the local history is not trustworthy.
    #[error("PoH chain corrupted at entry {index}")]
    ChainCorrupted { index: u64 },

    #[error("PoH entry {index} references transaction {tx} which is not available")]
    MissingTransaction { index: u64, tx: String },

    #[error("PoH can only be reset before the first entry")]
    ResetAfterGenesis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PohConfig {
    /// Minimum spacing between tick entries.
    pub tick_interval_ms: u64,
}

impl Default for PohConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

/// One link of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PohEntry {
    /// Position in the chain, starting at 0.
    pub index: u64,
    pub hash: Hash,
    /// Set for transaction entries, `None` for ticks.
    pub transaction: Option<TxId>,
    /// Total hashes performed since genesis, this entry included.
    pub num_hashes: u64,
    /// Unix ms at which the entry was appended.
    pub timestamp: u64,
}

impl PohEntry {
    pub fn is_tick(&self) -> bool {
        self.transaction.is_none()
    }
}

struct PohState {
    seed: Hash,
    entries: Vec<PohEntry>,
    last_tick_ms: u64,
}

impl PohState {
    fn head(&self) -> Hash {
        self.entries.last().map(|e| e.hash).unwrap_or(self.seed)
    }

    fn append(&mut self, hash: Hash, transaction: Option<TxId>, timestamp: u64) -> PohEntry {
        let index = self.entries.len() as u64;
        let entry = PohEntry {
            index,
            hash,
            transaction,
            num_hashes: index + 1,
            timestamp,
        };
        self.entries.push(entry.clone());
        entry
    }
}

/// The sequencer.
pub struct PohSequencer {
    config: PohConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PohState>,
}

impl PohSequencer {
    /// Start a chain from `seed`. The first tick is allowed one
    /// `tick_interval_ms` after construction.
    pub fn new(config: PohConfig, clock: Arc<dyn Clock>, seed: Hash) -> Self {
        let now = clock.now_ms();
        Self {
            config,
            clock,
            state: Mutex::new(PohState {
                seed,
                entries: Vec::new(),
                last_tick_ms: now,
            }),
        }
    }

    /// Append a tick if at least `tick_interval_ms` has passed since the
    /// last one.
    pub fn tick(&self) -> Option<PohEntry> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if now.saturating_sub(state.last_tick_ms) < self.config.tick_interval_ms {
            return None;
        }
        let hash = sha256(&state.head());
        state.last_tick_ms = now;
        let entry = state.append(hash, None, now);
        trace!(index = entry.index, "poh tick");
        Some(entry)
    }

    /// Mix a transaction into the chain.
    pub fn ingest_transaction(&self, tx: &Transaction) -> PohEntry {
        let now = self.clock.now_ms();
        let canonical = tx.canonical_bytes();
        let mut state = self.state.lock();
        let head = state.head();
        let hash = sha256_multi(&[&head, &canonical]);
        state.append(hash, Some(tx.id), now)
    }

    /// Copy of the whole chain.
    pub fn sequence(&self) -> Vec<PohEntry> {
        self.state.lock().entries.clone()
    }

    /// Entries with `index >= from`.
    pub fn entries_since(&self, from: u64) -> Vec<PohEntry> {
        let state = self.state.lock();
        let start = (from as usize).min(state.entries.len());
        state.entries[start..].to_vec()
    }

    /// Hash of the newest entry, or the seed if there is none yet.
    pub fn current_hash(&self) -> Hash {
        self.state.lock().head()
    }

    pub fn seed(&self) -> Hash {
        self.state.lock().seed
    }

    pub fn len(&self) -> u64 {
        self.state.lock().entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Replace the genesis seed. Refused once anything has been appended:
    /// the chain never shrinks.
    pub fn reset(&self, seed: Hash) -> Result<(), PohError> {
        let mut state = self.state.lock();
        if !state.entries.is_empty() {
            return Err(PohError::ResetAfterGenesis);
        }
        state.seed = seed;
        state.last_tick_ms = self.clock.now_ms();
        Ok(())
    }

    /// Recompute every link of the local chain. `lookup` returns the
    /// canonical bytes of a transaction by id.
    pub fn verify_chain<F>(&self, lookup: F) -> Result<(), PohError>
    where
        F: Fn(&TxId) -> Option<Vec<u8>>,
    {
        let (seed, entries) = {
            let state = self.state.lock();
            (state.seed, state.entries.clone())
        };
        let result = verify_entries(&entries, seed, lookup);
        if let Err(PohError::ChainCorrupted { index }) = &result {
            error!(index, "local PoH chain failed verification");
        }
        result
    }
}

/// Check that `entries` form a valid chain continuing from `start_hash`.
///
/// Entries need not start at index 0; indices and the hash counter must
/// increase by one per entry.
pub fn verify_entries<F>(entries: &[PohEntry], start_hash: Hash, lookup: F) -> Result<(), PohError>
where
    F: Fn(&TxId) -> Option<Vec<u8>>,
{
    let mut prev = start_hash;
    let mut expected_index = entries.first().map(|e| e.index).unwrap_or(0);
    for entry in entries {
        if entry.index != expected_index || entry.num_hashes != entry.index + 1 {
            return Err(PohError::ChainCorrupted { index: entry.index });
        }
        let hash = match &entry.transaction {
            None => sha256(&prev),
            Some(tx_id) => {
                let bytes = lookup(tx_id).ok_or_else(|| PohError::MissingTransaction {
                    index: entry.index,
                    tx: hex::encode(tx_id),
                })?;
                sha256_multi(&[&prev, &bytes])
            }
        };
        if hash != entry.hash {
            return Err(PohError::ChainCorrupted { index: entry.index });
        }
        prev = hash;
        expected_index += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::clock::ManualClock;
    use crate::crypto::{NodeKeypair, ZERO_HASH};
    use std::collections::HashMap;

    fn sequencer() -> (PohSequencer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let poh = PohSequencer::new(PohConfig::default(), clock.clone(), ZERO_HASH);
        (poh, clock)
    }

    fn tx(n: u8) -> Transaction {
        Transaction::new_signed(&NodeKeypair::from_seed(&[n; 32]), vec![n; 8], n as u64)
    }

    #[test]
    fn tick_is_rate_limited() {
        let (poh, clock) = sequencer();
        assert!(poh.tick().is_none());
        clock.advance(99);
        assert!(poh.tick().is_none());
        clock.advance(1);
        let entry = poh.tick().unwrap();
        assert_eq!(entry.index, 0);
        assert_eq!(entry.hash, sha256(&ZERO_HASH));
        assert!(entry.is_tick());
        assert!(poh.tick().is_none());
    }

    #[test]
    fn links_hold_for_mixed_entries() {
        let (poh, clock) = sequencer();
        let txs = [tx(1), tx(2), tx(3)];
        clock.advance(100);
        poh.tick().unwrap();
        let e1 = poh.ingest_transaction(&txs[0]);
        let e2 = poh.ingest_transaction(&txs[1]);
        clock.advance(100);
        poh.tick().unwrap();
        poh.ingest_transaction(&txs[2]);

        let seq = poh.sequence();
        assert_eq!(seq.len(), 5);
        assert_eq!(e2.hash, sha256_multi(&[&e1.hash, &txs[1].canonical_bytes()]));
        assert_eq!(seq[3].hash, sha256(&e2.hash));
        assert_eq!(poh.current_hash(), seq[4].hash);

        let by_id: HashMap<TxId, Vec<u8>> =
            txs.iter().map(|t| (t.id, t.canonical_bytes())).collect();
        poh.verify_chain(|id| by_id.get(id).cloned()).unwrap();
    }

    #[test]
    fn length_never_decreases() {
        let (poh, clock) = sequencer();
        let mut last = 0;
        for i in 0..20u8 {
            if i % 3 == 0 {
                clock.advance(150);
                poh.tick();
            } else {
                poh.ingest_transaction(&tx(i));
            }
            assert!(poh.len() > last);
            last = poh.len();
        }
    }

    #[test]
    fn tampering_is_detected() {
        let (poh, clock) = sequencer();
        for _ in 0..4 {
            clock.advance(100);
            poh.tick().unwrap();
        }
        let mut entries = poh.sequence();
        entries[2].hash[0] ^= 0xff;
        assert_eq!(
            verify_entries(&entries, ZERO_HASH, |_| None),
            Err(PohError::ChainCorrupted { index: 2 })
        );

        let mut skipped = poh.sequence();
        skipped.remove(1);
        assert!(verify_entries(&skipped, ZERO_HASH, |_| None).is_err());
    }

    #[test]
    fn verify_from_the_middle() {
        let (poh, clock) = sequencer();
        for _ in 0..6 {
            clock.advance(100);
            poh.tick().unwrap();
        }
        let all = poh.sequence();
        let tail = poh.entries_since(3);
        assert_eq!(tail.len(), 3);
        verify_entries(&tail, all[2].hash, |_| None).unwrap();
        assert!(poh.entries_since(99).is_empty());
    }

    #[test]
    fn missing_transaction_is_reported() {
        let (poh, _) = sequencer();
        poh.ingest_transaction(&tx(9));
        assert!(matches!(
            poh.verify_chain(|_| None),
            Err(PohError::MissingTransaction { index: 0, .. })
        ));
    }

    #[test]
    fn reset_only_at_genesis() {
        let (poh, _) = sequencer();
        poh.reset([7; 32]).unwrap();
        assert_eq!(poh.current_hash(), [7; 32]);
        poh.ingest_transaction(&tx(1));
        assert_eq!(poh.reset(ZERO_HASH), Err(PohError::ResetAfterGenesis));
        assert_eq!(poh.len(), 1);
        assert_eq!(poh.seed(), [7; 32]);
    }
}
