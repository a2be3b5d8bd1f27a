//! # Consensus Node
//!
//! `ConsensusNode` is the top-level runtime entity of a QUASAR cluster
//! member. It owns nothing clever itself; it wires the components together
//! and decides what happens when:
//!
//! ```text
//!  slot timer ──► PoH tick ──► schedule.advance() ──► produce (if we led)
//!                                                  └► gulf stream retry
//!  gossip timer ─► liveness / push / pull ──► registry, schedule
//!  inbound ─────► decode ─► dedup ─► dispatch by message kind
//! ```
//!
//! A node produces the block for a slot when that slot ends, so every
//! transaction forwarded to it during the slot makes it in. Slot 0 belongs
//! to genesis and is never produced.
//!
//! Everything arrives through one admission path regardless of how it was
//! carried: an INV answered with TX, a legacy TRANSACTION, or a local
//! submit all end in [`ConsensusNode::admit`]; shreds, BLOCK_DATA, legacy
//! BLOCK and sync responses all end in [`ConsensusNode::accept_block`].
//!
//! Construct it explicitly, hand it a [`Transport`], and call
//! [`ConsensusNode::run`] with a shutdown receiver. There are no globals.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::gossip::{CrdsEntry, CrdsValue, GossipService, MergeOutcome};
use super::gulf_stream::{ForwardReport, GulfStreamForwarder};
use super::mempool::{Mempool, MempoolError, TransactionPool};
use super::message::{
    Envelope, InventoryItem, InventoryKind, MessageDeduplicator, MessageError, MessageKind,
    Outbound,
};
use super::shred::{Shred, ShredError};
use super::transport::{Inbound, Outbox, Transport};
use super::turbine::TurbineDisseminator;
use crate::config::{
    ConfigError, NodeConfig, BLOCKCHAIN_RESPONSE_LIMIT, BLOCK_HEADER_RESERVE_BYTES,
    MAX_BLOCK_BYTES, MAX_SHREDS_PER_BLOCK, MAX_TXS_PER_BLOCK,
};
use crate::consensus::clock::Clock;
use crate::consensus::poh::{verify_entries, PohError, PohSequencer};
use crate::consensus::registry::{NodeId, NodeRegistry};
use crate::consensus::schedule::{LeaderSchedule, ScheduleError};
use crate::consensus::selector::LeaderSelector;
use crate::crypto::{short_hex, NodeKeypair, PublicKey, Signer};
use crate::events::{ConsensusEvent, EventBus};
use crate::storage::{Block, ChainError, ChainStore, InMemoryChain};
use crate::transaction::{Transaction, TransactionError, TxId};

/// Gossip rounds between re-publications of our own contact info.
const CONTACT_REFRESH_ROUNDS: u64 = 10;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Shred(#[from] ShredError),

    #[error(transparent)]
    Poh(#[from] PohError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("block for slot {slot} is not from the scheduled leader")]
    WrongLeader { slot: u64 },
}

#[derive(Debug, Default)]
struct SlotState {
    last_slot: Option<u64>,
}

pub struct ConsensusNode {
    config: NodeConfig,
    node_id: NodeId,
    address: String,
    keypair: Arc<NodeKeypair>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    registry: Arc<NodeRegistry>,
    schedule: Arc<LeaderSchedule>,
    poh: PohSequencer,
    mempool: Arc<dyn TransactionPool>,
    chain: Arc<dyn ChainStore>,
    gossip: Arc<GossipService>,
    forwarder: Arc<GulfStreamForwarder>,
    turbine: TurbineDisseminator,
    outbox: Outbox,
    dedup: MessageDeduplicator,
    slot_state: Mutex<SlotState>,
    gossip_rounds: AtomicU64,
    retrying: Arc<AtomicBool>,
}

impl ConsensusNode {
    /// A node with the in-memory mempool and chain.
    pub fn new(
        config: NodeConfig,
        keypair: NodeKeypair,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NodeError> {
        let mempool = Arc::new(Mempool::new(config.mempool.clone(), clock.clone()));
        let chain = Arc::new(InMemoryChain::new());
        Self::with_stores(config, keypair, transport, clock, mempool, chain)
    }

    /// A node over caller-provided pool and chain storage.
    pub fn with_stores(
        config: NodeConfig,
        keypair: NodeKeypair,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        mempool: Arc<dyn TransactionPool>,
        chain: Arc<dyn ChainStore>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let keypair = Arc::new(keypair);
        let public_key = keypair.public_key();
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| public_key.to_base58());
        let address = transport.local_addr();
        let events = EventBus::default();

        let registry = Arc::new(NodeRegistry::new(config.registry.clone()));
        registry.upsert_contact(&node_id, public_key.clone(), &address, clock.now_ms());

        let schedule = Arc::new(LeaderSchedule::new(
            config.schedule.clone(),
            clock.clone(),
            registry.clone(),
            LeaderSelector::new(config.selector.clone()),
            events.clone(),
        ));
        let poh = PohSequencer::new(config.poh.clone(), clock.clone(), Block::genesis().hash());
        let outbox = Outbox::new(
            node_id.clone(),
            transport,
            config.network.max_inflight_sends,
            clock.clone(),
        );
        let signer: Arc<dyn Signer> = keypair.clone();
        let gossip = Arc::new(GossipService::new(
            config.gossip.clone(),
            node_id.clone(),
            signer,
            address.clone(),
            registry.clone(),
            clock.clone(),
            events.clone(),
        ));
        schedule.set_publisher(gossip.clone());
        gossip.publish_contact_info();

        let forwarder = Arc::new(GulfStreamForwarder::new(
            config.gulf_stream.clone(),
            schedule.clone(),
            registry.clone(),
            outbox.clone(),
            clock.clone(),
            events.clone(),
        ));
        let turbine = TurbineDisseminator::new(
            config.turbine.clone(),
            node_id.clone(),
            clock.clone(),
            events.clone(),
        );
        let dedup = MessageDeduplicator::new(config.network.dedup_window_ms);

        info!(node = %node_id, address = %address, key = %public_key, "consensus node created");

        Ok(Self {
            config,
            node_id,
            address,
            keypair,
            clock,
            events,
            registry,
            schedule,
            poh,
            mempool,
            chain,
            gossip,
            forwarder,
            turbine,
            outbox,
            dedup,
            slot_state: Mutex::new(SlotState::default()),
            gossip_rounds: AtomicU64::new(0),
            retrying: Arc::new(AtomicBool::new(false)),
        })
    }

    // -- accessors ---------------------------------------------------------

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn schedule(&self) -> &Arc<LeaderSchedule> {
        &self.schedule
    }

    pub fn poh(&self) -> &PohSequencer {
        &self.poh
    }

    pub fn mempool(&self) -> &Arc<dyn TransactionPool> {
        &self.mempool
    }

    pub fn chain(&self) -> &Arc<dyn ChainStore> {
        &self.chain
    }

    pub fn gossip(&self) -> &Arc<GossipService> {
        &self.gossip
    }

    pub fn forwarder(&self) -> &Arc<GulfStreamForwarder> {
        &self.forwarder
    }

    pub fn turbine(&self) -> &TurbineDisseminator {
        &self.turbine
    }

    /// Start gossiping with a peer we learned about out of band.
    pub fn add_peer(&self, node_id: &str, public_key: PublicKey, address: &str) {
        self.registry
            .upsert_contact(node_id, public_key, address, self.clock.now_ms());
        self.gossip.add_peer(node_id, address);
    }

    // -- transactions ------------------------------------------------------

    /// Admit a locally submitted transaction and forward it to the upcoming
    /// leaders.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<ForwardReport, NodeError> {
        self.admit(tx.clone())?;
        Ok(self.forwarder.forward(&tx).await)
    }

    /// Admit a transaction that came in off the wire and, if it was new to
    /// us, forward it in the background.
    fn admit_and_forward(&self, tx: Transaction) -> Result<(), NodeError> {
        if !self.admit(tx.clone())? {
            return Ok(());
        }
        let forwarder = Arc::clone(&self.forwarder);
        tokio::spawn(async move {
            forwarder.forward(&tx).await;
        });
        Ok(())
    }

    /// Verify and pool a transaction. `Ok(false)` if we already had it.
    pub fn admit(&self, tx: Transaction) -> Result<bool, NodeError> {
        if self.mempool.contains(&tx.id) {
            return Ok(false);
        }
        tx.verify()?;
        match self.mempool.add(tx) {
            Ok(()) => Ok(true),
            Err(MempoolError::DuplicateTransaction) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // -- slots -------------------------------------------------------------

    /// Called on every timer tick. Appends a PoH tick when one is due and,
    /// once per slot, advances the schedule, produces the block for the
    /// slot that just ended if we led it, and starts retrying pending
    /// forwards on a background task.
    pub async fn on_slot_tick(&self) -> Result<(), NodeError> {
        self.poh.tick();
        let slot = self.schedule.current_slot();
        let previous = {
            let mut state = self.slot_state.lock();
            if state.last_slot == Some(slot) {
                return Ok(());
            }
            state.last_slot.replace(slot)
        };

        match self.schedule.advance() {
            Ok(_) => {}
            Err(ScheduleError::EmptyRegistry) => {
                debug!(slot, "registry empty, schedule unchanged");
            }
            Err(e) => warn!(slot, error = %e, "schedule advance failed"),
        }
        let leader = self.schedule.leader_for_slot(slot);
        debug!(slot, leader = ?leader, "slot advanced");
        self.events.emit(ConsensusEvent::SlotAdvanced {
            slot,
            epoch: self.schedule.current_epoch(),
            leader,
        });

        if let Some(ended) = previous.filter(|s| *s >= 1 && *s < slot) {
            if self.schedule.leader_for_slot(ended).as_deref() == Some(self.node_id.as_str()) {
                self.produce_block(ended)?;
            }
            self.record_missed_slot(ended.saturating_sub(1));
        }

        self.spawn_forward_retries();
        Ok(())
    }

    /// At most one retry pass runs at a time; a pass still stuck on a slow
    /// peer when the next slot starts is left to finish on its own.
    fn spawn_forward_retries(&self) {
        if self.forwarder.pending_count() == 0 || self.retrying.swap(true, Ordering::AcqRel) {
            return;
        }
        let forwarder = Arc::clone(&self.forwarder);
        let retrying = Arc::clone(&self.retrying);
        tokio::spawn(async move {
            forwarder.retry_pending().await;
            retrying.store(false, Ordering::Release);
        });
    }

    /// Build, sign, append and broadcast the block for `slot`.
    ///
    /// The drain is bounded by count and by encoded size, so the block
    /// always fits one message and the shred limit. If the block cannot be
    /// shredded or appended, its transactions go back to the pool and the
    /// chain is left untouched.
    ///
    /// Returns `Ok(None)` if the chain has already moved past `slot`.
    pub fn produce_block(&self, slot: u64) -> Result<Option<Block>, NodeError> {
        let tip = self.chain.tip();
        if slot <= tip.slot() {
            debug!(slot, tip = tip.slot(), "chain already past slot, not producing");
            return Ok(None);
        }

        let transactions = self
            .mempool
            .drain_for_leader(MAX_TXS_PER_BLOCK, self.block_byte_budget());
        let start_hash = self.poh.current_hash();
        let start_index = self.poh.len();
        for tx in &transactions {
            self.poh.ingest_transaction(tx);
        }
        let recorded = self.poh.entries_since(start_index);
        let lookup = |id: &TxId| {
            transactions
                .iter()
                .find(|tx| tx.id == *id)
                .map(|tx| tx.canonical_bytes())
        };
        if let Err(e) = verify_entries(&recorded, start_hash, lookup) {
            if let PohError::ChainCorrupted { index } = e {
                error!(index, "PoH chain corrupted while producing");
                self.events.emit(ConsensusEvent::PohCorrupted { index });
            }
            self.mempool.requeue(transactions);
            return Err(e.into());
        }

        let tx_ids: Vec<TxId> = transactions.iter().map(|tx| tx.id).collect();
        let block = Block::new_signed(
            slot,
            tip.hash(),
            self.poh.current_hash(),
            transactions,
            self.keypair.as_ref(),
            self.clock.now_ms(),
        );
        let broadcast = match self
            .turbine
            .prepare_broadcast(&block, &self.registry.addressed_peers())
        {
            Ok(broadcast) => broadcast,
            Err(e) => {
                warn!(slot, error = %e, "block could not be shredded, transactions re-queued");
                self.mempool.requeue(block.transactions);
                return Err(e.into());
            }
        };
        if let Err(e) = self.chain.append_block(block.clone()) {
            warn!(slot, error = %e, "produced block not appended, transactions re-queued");
            self.mempool.requeue(block.transactions);
            return Err(e.into());
        }
        self.record_proposal(&self.node_id, true);
        self.forwarder.mark_confirmed(&tx_ids);

        let sent = broadcast.sends.len();
        self.send_all(broadcast.sends);

        info!(
            slot,
            block = %short_hex(&block.hash()),
            transactions = block.tx_count(),
            shreds = broadcast.shreds.len(),
            "produced block"
        );
        self.events.emit(ConsensusEvent::BlockProduced {
            slot,
            hash: block.hash_hex(),
            transactions: block.tx_count(),
            shreds: broadcast.shreds.len(),
        });
        if sent > 0 {
            self.events.emit(ConsensusEvent::ShredsSent { count: sent });
        }
        Ok(Some(block))
    }

    /// Transaction bytes one block may carry: whatever fits both a single
    /// envelope and `MAX_SHREDS_PER_BLOCK` shreds, less the header.
    fn block_byte_budget(&self) -> usize {
        let shred_capacity = self
            .turbine
            .codec()
            .payload_size()
            .saturating_mul(MAX_SHREDS_PER_BLOCK as usize);
        MAX_BLOCK_BYTES
            .min(shred_capacity)
            .saturating_sub(BLOCK_HEADER_RESERVE_BYTES)
    }

    fn record_proposal(&self, node_id: &str, success: bool) {
        if let Err(e) = self.registry.record_proposal(node_id, success) {
            warn!(node = %node_id, success, error = %e, "proposal not recorded");
        }
    }

    /// A slot whose block never arrived counts against its leader.
    fn record_missed_slot(&self, slot: u64) {
        if slot == 0 || self.chain.block_at_slot(slot).is_some() {
            return;
        }
        if let Some(leader) = self.schedule.leader_for_slot(slot) {
            if leader != self.node_id {
                debug!(slot, leader = %leader, "no block seen for slot");
                self.record_proposal(&leader, false);
            }
        }
    }

    // -- blocks ------------------------------------------------------------

    /// Validate a block and append it. `Ok(false)` for one we already have.
    /// On a parent mismatch we ask `sync_from` (or any healthy peer) for the
    /// blocks we are missing.
    pub fn accept_block(&self, block: Block, sync_from: Option<&str>) -> Result<bool, NodeError> {
        let hash = block.hash();
        let slot = block.slot();
        if self.chain.contains(&hash) {
            return Ok(false);
        }
        if let Err(e) = block.verify() {
            self.reject(slot, &e.to_string());
            return Err(ChainError::InvalidBlock(e).into());
        }

        let leader = match self.schedule.leader_key_for_slot(slot) {
            Some((leader, key)) if key == block.header.leader => Some(leader),
            Some(_) => {
                self.reject(slot, "not signed by the scheduled leader");
                return Err(NodeError::WrongLeader { slot });
            }
            // No table covers the slot (catching up). Accept any member.
            None if self.is_member_key(&block.header.leader) => None,
            None => {
                self.reject(slot, "leader is not a cluster member");
                return Err(NodeError::WrongLeader { slot });
            }
        };

        let tx_ids: Vec<TxId> = block.transactions.iter().map(|tx| tx.id).collect();
        match self.chain.append_block(block) {
            Ok(()) => {}
            Err(ChainError::Duplicate(_)) => return Ok(false),
            Err(e @ ChainError::ParentMismatch { .. }) => {
                debug!(slot, error = %e, "block does not extend our tip, syncing");
                self.request_sync(sync_from);
                return Err(e.into());
            }
            Err(e) => {
                self.reject(slot, &e.to_string());
                return Err(e.into());
            }
        }

        self.mempool.remove(&tx_ids);
        self.forwarder.mark_confirmed(&tx_ids);
        self.turbine.mark_completed(hash);
        if let Some(leader) = &leader {
            self.record_proposal(leader, true);
        }
        info!(slot, block = %short_hex(&hash), transactions = tx_ids.len(), "accepted block");
        self.events.emit(ConsensusEvent::BlockAccepted {
            slot,
            hash: hex::encode(hash),
        });
        Ok(true)
    }

    fn reject(&self, slot: u64, reason: &str) {
        warn!(slot, reason, "rejected block");
        self.events.emit(ConsensusEvent::BlockRejected {
            slot,
            reason: reason.to_string(),
        });
    }

    fn is_member_key(&self, key: &PublicKey) -> bool {
        self.registry
            .snapshot()
            .records()
            .iter()
            .any(|r| &r.public_key == key)
    }

    /// Ask a peer for every block after our tip.
    pub fn request_sync(&self, from: Option<&str>) {
        let address = match from {
            Some(addr) => addr.to_string(),
            None => match self.gossip.healthy_peers().choose(&mut rand::thread_rng()) {
                Some((_, addr)) => addr.clone(),
                None => {
                    debug!("no peer to sync from");
                    return;
                }
            },
        };
        let from_slot = self.chain.tip().slot() + 1;
        debug!(to = %address, from_slot, "requesting chain sync");
        self.outbox
            .spawn_send(address, MessageKind::BlockchainRequest { from_slot });
    }

    /// The blocks answering a BLOCKCHAIN request from `from_slot`: at most
    /// `BLOCKCHAIN_RESPONSE_LIMIT` of them and at most `MAX_BLOCK_BYTES`
    /// encoded, so the response always fits one envelope.
    pub fn sync_page(&self, from_slot: u64) -> Vec<Block> {
        let mut budget = MAX_BLOCK_BYTES;
        let mut page = Vec::new();
        for block in self
            .chain
            .blocks_from_slot(from_slot.max(1), BLOCKCHAIN_RESPONSE_LIMIT)
        {
            let size = block.encoded_len();
            if size > budget {
                break;
            }
            budget -= size;
            page.push(block);
        }
        page
    }

    fn on_shred(&self, shred: Shred) -> Result<(), NodeError> {
        let leader = self.schedule.leader_for_slot(shred.slot);
        let peers = self.registry.addressed_peers();
        let receipt = self.turbine.on_shred(shred, leader.as_deref(), &peers)?;
        if receipt.duplicate {
            return Ok(());
        }
        let count = receipt.retransmit.len();
        if count > 0 {
            self.send_all(receipt.retransmit);
            self.events.emit(ConsensusEvent::ShredsSent { count });
        }
        let leader_addr = leader.and_then(|l| self.registry.address_of(&l));
        if let Some(e) = receipt.failed {
            self.request_sync(leader_addr.as_deref());
            return Err(e.into());
        }
        if let Some(block) = receipt.completed {
            self.accept_block(block, leader_addr.as_deref())?;
        }
        Ok(())
    }

    // -- inbound -----------------------------------------------------------

    /// Decode, deduplicate and dispatch one inbound message.
    pub async fn handle_inbound(&self, from_addr: &str, bytes: &[u8]) -> Result<(), NodeError> {
        if bytes.len() > self.config.network.max_message_size {
            return Err(MessageError::TooLarge {
                size: bytes.len(),
                max: self.config.network.max_message_size,
            }
            .into());
        }
        let envelope = Envelope::decode(bytes)?;
        if envelope.sender == self.node_id {
            return Ok(());
        }
        let now = self.clock.now_ms();
        if !self.dedup.check_and_insert(envelope.message_id(), now) {
            return Ok(());
        }
        self.registry.touch(&envelope.sender, now);

        let reply = if envelope.reply_to.is_empty() {
            from_addr.to_string()
        } else {
            envelope.reply_to
        };
        self.dispatch(envelope.sender, reply, envelope.kind).await
    }

    async fn dispatch(&self, sender: NodeId, reply: String, kind: MessageKind) -> Result<(), NodeError> {
        match kind {
            MessageKind::Discovery(info) => {
                if info.node_id != sender {
                    debug!(sender = %sender, claimed = %info.node_id, "discovery for someone else, ignored");
                    return Ok(());
                }
                if let Some(known) = self.registry.get(&info.node_id) {
                    if known.public_key != info.public_key {
                        warn!(node = %info.node_id, "discovery with a different key, ignored");
                        return Ok(());
                    }
                }
                let new = self.registry.upsert_contact(
                    &info.node_id,
                    info.public_key,
                    &info.address,
                    self.clock.now_ms(),
                );
                self.gossip.add_peer(&info.node_id, &info.address);
                if new {
                    self.outbox
                        .spawn_send(reply, MessageKind::Discovery(self.gossip.contact_info()));
                }
            }
            MessageKind::Transaction(tx) => self.admit_and_forward(tx)?,
            MessageKind::Tx { payload } => {
                let tx: Transaction = bincode::deserialize(&payload)
                    .map_err(|e| MessageError::Malformed(e.to_string()))?;
                self.admit_and_forward(tx)?;
            }
            MessageKind::Block(block) => {
                self.accept_block(block, Some(&reply))?;
            }
            MessageKind::BlockData { payload } => {
                let block = Block::from_bytes(&payload).map_err(ChainError::InvalidBlock)?;
                self.accept_block(block, Some(&reply))?;
            }
            MessageKind::BlockchainRequest { from_slot } => {
                let blocks = self.sync_page(from_slot);
                if !blocks.is_empty() {
                    self.outbox.spawn_send(reply, MessageKind::Blockchain { blocks });
                }
            }
            MessageKind::Blockchain { mut blocks } => {
                blocks.sort_by_key(|b| b.slot());
                let mut appended = 0usize;
                for block in blocks.into_iter().filter(|b| !b.is_genesis()) {
                    match self.accept_block(block, None) {
                        Ok(true) => appended += 1,
                        Ok(false) => {}
                        Err(e) => {
                            debug!(error = %e, "sync stopped at an unacceptable block");
                            break;
                        }
                    }
                }
                if appended > 0 {
                    info!(appended, tip = self.chain.tip().slot(), "synced blocks");
                    // Responses are paged; keep asking until one comes back empty.
                    self.request_sync(Some(&reply));
                }
            }
            MessageKind::Inv { items } => {
                let wanted: Vec<InventoryItem> = items
                    .into_iter()
                    .filter(|item| match item.kind {
                        InventoryKind::Tx => !self.mempool.contains(&item.hash),
                        InventoryKind::Block => {
                            !self.chain.contains(&item.hash) && !self.turbine.is_completed(&item.hash)
                        }
                    })
                    .collect();
                if !wanted.is_empty() {
                    self.outbox
                        .spawn_send(reply, MessageKind::GetData { items: wanted });
                }
            }
            MessageKind::GetData { items } => self.serve_get_data(&reply, items),
            MessageKind::Ping { nonce, sent_at } => {
                self.outbox
                    .spawn_send(reply, MessageKind::Pong { nonce, sent_at });
            }
            MessageKind::Pong { nonce, .. } => {
                self.gossip.handle_pong(&sender, nonce);
            }
            MessageKind::Push { entries } => {
                let outcome = self.gossip.handle_push(&sender, entries);
                self.apply_merge(outcome);
            }
            MessageKind::PullRequest { digest } => {
                let entries = self.gossip.handle_pull_request(&digest);
                if !entries.is_empty() {
                    self.outbox
                        .spawn_send(reply, MessageKind::PullResponse { entries });
                }
            }
            MessageKind::PullResponse { entries } => {
                let outcome = self.gossip.handle_pull_response(&sender, entries);
                self.apply_merge(outcome);
            }
            MessageKind::Prune { origins } => self.gossip.handle_prune(&sender, origins),
            MessageKind::Shred(shred) => self.on_shred(shred)?,
        }
        Ok(())
    }

    fn serve_get_data(&self, reply: &str, items: Vec<InventoryItem>) {
        for item in items {
            let kind = match item.kind {
                InventoryKind::Tx => self
                    .mempool
                    .get(&item.hash)
                    .and_then(|tx| bincode::serialize(&tx).ok())
                    .map(|payload| MessageKind::Tx { payload }),
                InventoryKind::Block => self
                    .chain
                    .get(&item.hash)
                    .and_then(|block| block.to_bytes().ok())
                    .map(|payload| MessageKind::BlockData { payload }),
            };
            match kind {
                Some(kind) => self.outbox.spawn_send(reply.to_string(), kind),
                None => debug!(item = %short_hex(&item.hash), "getdata for unknown item"),
            }
        }
    }

    /// Feed freshly merged CRDS entries to the registry and the schedule.
    fn apply_merge(&self, outcome: MergeOutcome) {
        for entry in outcome.accepted {
            self.apply_entry(entry);
        }
        if let Some(prune) = outcome.prune {
            self.send_all(vec![prune]);
        }
    }

    fn apply_entry(&self, entry: CrdsEntry) {
        match entry.value {
            CrdsValue::ContactInfo(info) => {
                if info.node_id == self.node_id {
                    return;
                }
                self.registry
                    .upsert_contact(&info.node_id, info.public_key, &info.address, entry.wallclock);
                self.gossip.add_peer(&info.node_id, &info.address);
            }
            CrdsValue::LeaderSchedule(table) => {
                let epoch = table.epoch;
                match self.schedule.install_table(table, &entry.origin) {
                    Ok(_) => {}
                    Err(ScheduleError::StaleTable { .. }) => {
                        debug!(epoch, origin = %entry.origin, "ignored schedule for another epoch");
                    }
                    Err(e) => warn!(epoch, origin = %entry.origin, error = %e, "gossiped schedule rejected"),
                }
            }
        }
    }

    // -- gossip ------------------------------------------------------------

    /// One gossip round: liveness pings, push, pull, then housekeeping.
    pub fn gossip_round(&self) {
        let round = self.gossip_rounds.fetch_add(1, Ordering::Relaxed) + 1;
        if round % CONTACT_REFRESH_ROUNDS == 0 {
            self.gossip.publish_contact_info();
        }
        let now = self.clock.now_ms();
        self.registry.touch(&self.node_id, now);

        let mut sends = self.gossip.liveness_round();
        sends.extend(self.gossip.push_round());
        sends.extend(self.gossip.pull_round());
        self.send_all(sends);

        self.registry.evict_stale_default(now, &self.node_id);
        self.dedup.purge(now);
        self.forwarder.purge_expired();
        self.mempool.expire_old();
        if !self.turbine.purge_expired().is_empty() {
            self.request_sync(None);
        }
    }

    /// Announce ourselves to the configured bootstrap peers and ask them for
    /// the chain. Returns how many were reachable.
    pub async fn bootstrap(&self) -> usize {
        let from_slot = self.chain.tip().slot() + 1;
        let mut reached = 0;
        for addr in &self.config.network.bootstrap_peers {
            if addr == &self.address {
                continue;
            }
            let hello = MessageKind::Discovery(self.gossip.contact_info());
            match self.outbox.send(addr, hello).await {
                Ok(()) => {
                    reached += 1;
                    self.outbox
                        .spawn_send(addr.clone(), MessageKind::BlockchainRequest { from_slot });
                }
                Err(e) => warn!(peer = %addr, error = %e, "bootstrap peer unreachable"),
            }
        }
        info!(reached, configured = self.config.network.bootstrap_peers.len(), "bootstrap complete");
        reached
    }

    fn send_all(&self, sends: Vec<Outbound>) {
        for send in sends {
            self.outbox.spawn_send(send.address, send.kind);
        }
    }

    // -- runtime -----------------------------------------------------------

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Spawns the slot timer and the gossip loop, and dispatches inbound
    /// messages on the calling task.
    pub async fn run(self: Arc<Self>, mut inbound: Inbound, mut shutdown: watch::Receiver<bool>) {
        self.bootstrap().await;
        let slot_task = tokio::spawn(Arc::clone(&self).slot_loop(shutdown.clone()));
        let gossip_task = tokio::spawn(Arc::clone(&self).gossip_loop(shutdown.clone()));

        info!(node = %self.node_id, "consensus node running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                message = inbound.recv() => match message {
                    Some((from, bytes)) => {
                        if let Err(e) = self.handle_inbound(&from, &bytes).await {
                            debug!(from = %from, error = %e, "inbound message dropped");
                        }
                    }
                    None => {
                        info!("inbound channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = tokio::join!(slot_task, gossip_task);
        info!(node = %self.node_id, "consensus node stopped");
    }

    async fn slot_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let tick = Duration::from_millis(self.config.poh.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.on_slot_tick().await {
                        Ok(()) => {}
                        Err(NodeError::Poh(e)) => {
                            error!(error = %e, "PoH failure, slot timer stopping");
                            return;
                        }
                        Err(e) => warn!(error = %e, "slot processing failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.gossip.interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.gossip_round(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
