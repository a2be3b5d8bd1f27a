//! # Gulf Stream
//!
//! Mempool-less forwarding. Instead of gossiping a new transaction to the
//! whole cluster and hoping the leader hears about it, a node sends it
//! straight to the leaders who can actually include it: the current one
//! and the next `max_forwarding_slots` distinct ones. By the time a leader's
//! slot starts its pool is already full.
//!
//! What goes out is an INV announcing the transaction id. A target that
//! lacks the transaction answers GETDATA and gets the body back from our
//! mempool, so a leader that heard about it from three forwarders downloads
//! it once.
//!
//! ## Bookkeeping
//!
//! One [`ForwardingRecord`] per transaction remembers which targets have
//! already taken the INV. Forwarding is idempotent per `(tx, target)` for
//! `forward_ttl_ms`; a target that could not be reached stays undelivered
//! and is retried by [`GulfStreamForwarder::retry_pending`] at the next
//! slot, against whatever the schedule says the targets are *then*.
//! Records go away when the transaction shows up in an accepted block or
//! when they expire.
//!
//! Sends are bounded by the end of the slot they were started in. Anything
//! still outstanding when the slot turns over is abandoned rather than
//! delivered to a leader whose turn may already be gone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::message::{InventoryItem, MessageKind};
use super::transport::{Outbox, TransportError};
use crate::config::DEFAULT_FORWARD_TTL_MS;
use crate::consensus::clock::Clock;
use crate::consensus::registry::{NodeId, NodeRegistry};
use crate::consensus::schedule::LeaderSchedule;
use crate::crypto::short_hex;
use crate::events::{ConsensusEvent, EventBus};
use crate::transaction::{Transaction, TxId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GulfStreamConfig {
    /// How long a forwarding record lives without confirmation.
    pub forward_ttl_ms: u64,
    /// Records kept at once; the oldest is dropped beyond this.
    pub max_records: usize,
}

impl Default for GulfStreamConfig {
    fn default() -> Self {
        Self {
            forward_ttl_ms: DEFAULT_FORWARD_TTL_MS,
            max_records: 50_000,
        }
    }
}

/// Which targets have taken a transaction's INV, and when.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardingRecord {
    pub tx_id: TxId,
    pub forwarded_at: u64,
    /// target → unix ms of the successful send.
    pub delivered: BTreeMap<NodeId, u64>,
}

/// Outcome of one forwarding pass over one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardReport {
    pub delivered: Vec<NodeId>,
    /// Ourselves, or targets that already have the INV.
    pub skipped: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
    /// Sends given up because the slot turned over first.
    pub abandoned: Vec<NodeId>,
}

/// Cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardStats {
    pub forwarded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub abandoned: u64,
}

enum SendOutcome {
    Delivered,
    Failed(String),
    Abandoned,
}

pub struct GulfStreamForwarder {
    config: GulfStreamConfig,
    node_id: NodeId,
    schedule: Arc<LeaderSchedule>,
    registry: Arc<NodeRegistry>,
    outbox: Outbox,
    clock: Arc<dyn Clock>,
    events: EventBus,
    records: DashMap<TxId, ForwardingRecord>,
    forwarded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

impl GulfStreamForwarder {
    pub fn new(
        config: GulfStreamConfig,
        schedule: Arc<LeaderSchedule>,
        registry: Arc<NodeRegistry>,
        outbox: Outbox,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            node_id: outbox.node_id().clone(),
            schedule,
            registry,
            outbox,
            clock,
            events,
            records: DashMap::new(),
            forwarded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Announce a newly admitted transaction to the current and upcoming
    /// leaders.
    pub async fn forward(&self, tx: &Transaction) -> ForwardReport {
        self.forward_in_slot(tx.id, self.schedule.current_slot()).await
    }

    /// Forward every pending transaction to the targets that have not taken
    /// it yet. Called once per slot.
    pub async fn retry_pending(&self) -> Vec<ForwardReport> {
        let targets = self.schedule.gulf_stream_targets();
        if targets.is_empty() {
            return Vec::new();
        }
        let now = self.clock.now_ms();
        let pending: Vec<TxId> = self
            .records
            .iter()
            .filter(|r| now.saturating_sub(r.forwarded_at) <= self.config.forward_ttl_ms)
            .filter(|r| {
                targets
                    .iter()
                    .any(|t| *t != self.node_id && !r.delivered.contains_key(t))
            })
            .map(|r| r.tx_id)
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        debug!(pending = pending.len(), "retrying gulf stream forwards");
        let slot = self.schedule.current_slot();
        let mut reports = Vec::with_capacity(pending.len());
        for tx_id in pending {
            reports.push(self.forward_in_slot(tx_id, slot).await);
        }
        reports
    }

    /// Transactions that made it into a block need no more forwarding.
    pub fn mark_confirmed(&self, tx_ids: &[TxId]) {
        for id in tx_ids {
            self.records.remove(id);
        }
    }

    /// Drop records older than `forward_ttl_ms`. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let ttl = self.config.forward_ttl_ms;
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_sub(r.forwarded_at) <= ttl);
        before - self.records.len()
    }

    pub fn record(&self, tx_id: &TxId) -> Option<ForwardingRecord> {
        self.records.get(tx_id).map(|r| r.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.records.len()
    }

    pub fn stats(&self) -> ForwardStats {
        ForwardStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    async fn forward_in_slot(&self, tx_id: TxId, slot: u64) -> ForwardReport {
        let now = self.clock.now_ms();
        let targets = self.schedule.gulf_stream_targets();
        let mut report = ForwardReport::default();
        if targets.is_empty() {
            debug!(tx = %short_hex(&tx_id), "no leader schedule yet, forward deferred");
        }

        self.ensure_record(tx_id, now);
        let already: BTreeSet<NodeId> = self
            .records
            .get(&tx_id)
            .map(|r| {
                r.delivered
                    .iter()
                    .filter(|(_, at)| now.saturating_sub(**at) <= self.config.forward_ttl_ms)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut sends = Vec::new();
        for target in targets {
            if target == self.node_id || already.contains(&target) {
                report.skipped.push(target);
                continue;
            }
            match self.registry.address_of(&target) {
                Some(address) => sends.push((target, address)),
                None => report
                    .failed
                    .push((target, "no known address".to_string())),
            }
        }

        let deadline = self.slot_deadline(slot, now);
        let results = join_all(sends.into_iter().map(|(target, address)| async move {
            let outcome = self.send_inv(tx_id, slot, &address, deadline).await;
            (target, outcome)
        }))
        .await;

        let sent_at = self.clock.now_ms();
        for (target, outcome) in results {
            match outcome {
                SendOutcome::Delivered => report.delivered.push(target),
                SendOutcome::Failed(reason) => report.failed.push((target, reason)),
                SendOutcome::Abandoned => report.abandoned.push(target),
            }
        }
        if let Some(mut record) = self.records.get_mut(&tx_id) {
            for target in &report.delivered {
                record.delivered.insert(target.clone(), sent_at);
            }
        }

        self.account(&tx_id, &report);
        report
    }

    async fn send_inv(&self, tx_id: TxId, slot: u64, address: &str, deadline: Duration) -> SendOutcome {
        if self.schedule.current_slot() != slot {
            return SendOutcome::Abandoned;
        }
        let inv = MessageKind::Inv {
            items: vec![InventoryItem::tx(tx_id)],
        };
        match tokio::time::timeout(deadline, self.outbox.send(address, inv)).await {
            Ok(Ok(())) => SendOutcome::Delivered,
            Ok(Err(TransportError::Closed)) => SendOutcome::Failed("transport closed".into()),
            Ok(Err(e)) => SendOutcome::Failed(e.to_string()),
            Err(_) => SendOutcome::Abandoned,
        }
    }

    /// Time left in `slot`, never less than a millisecond.
    fn slot_deadline(&self, slot: u64, now: u64) -> Duration {
        let end = self.schedule.slot_clock().slot_start_ms(slot + 1);
        Duration::from_millis(end.saturating_sub(now).max(1))
    }

    fn ensure_record(&self, tx_id: TxId, now: u64) {
        if self.records.contains_key(&tx_id) {
            return;
        }
        if self.records.len() >= self.config.max_records.max(1) {
            self.purge_expired();
        }
        if self.records.len() >= self.config.max_records.max(1) {
            let oldest = self
                .records
                .iter()
                .min_by_key(|r| (r.forwarded_at, r.tx_id))
                .map(|r| r.tx_id);
            if let Some(id) = oldest {
                self.records.remove(&id);
            }
        }
        self.records.insert(
            tx_id,
            ForwardingRecord {
                tx_id,
                forwarded_at: now,
                delivered: BTreeMap::new(),
            },
        );
    }

    fn account(&self, tx_id: &TxId, report: &ForwardReport) {
        self.forwarded
            .fetch_add(report.delivered.len() as u64, Ordering::Relaxed);
        self.skipped
            .fetch_add(report.skipped.len() as u64, Ordering::Relaxed);
        self.failed
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        self.abandoned
            .fetch_add(report.abandoned.len() as u64, Ordering::Relaxed);

        let tx_hex = hex::encode(tx_id);
        if !report.delivered.is_empty() {
            info!(
                tx = %short_hex(tx_id),
                targets = report.delivered.len(),
                "forwarded transaction to upcoming leaders"
            );
            self.events.emit(ConsensusEvent::TransactionForwarded {
                tx_id: tx_hex.clone(),
                targets: report.delivered.len(),
            });
        }
        for (target, reason) in &report.failed {
            warn!(tx = %short_hex(tx_id), target = %target, reason = %reason, "forward target unreachable");
            self.events.emit(ConsensusEvent::ForwardUnreachable {
                tx_id: tx_hex.clone(),
                target: target.clone(),
                reason: reason.clone(),
            });
        }
        if !report.abandoned.is_empty() {
            debug!(
                tx = %short_hex(tx_id),
                abandoned = report.abandoned.len(),
                "slot turned over, forwards abandoned"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::clock::ManualClock;
    use crate::consensus::schedule::ScheduleConfig;
    use crate::consensus::selector::LeaderSelector;
    use crate::crypto::NodeKeypair;
    use crate::network::message::Envelope;
    use crate::network::transport::{Inbound, MemoryNetwork};

    const GENESIS: u64 = 1_000_000;

    struct Harness {
        forwarder: GulfStreamForwarder,
        schedule: Arc<LeaderSchedule>,
        clock: Arc<ManualClock>,
        net: Arc<MemoryNetwork>,
        inbound: BTreeMap<NodeId, Inbound>,
        events: EventBus,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(GENESIS));
        let registry = Arc::new(NodeRegistry::default());
        let net = MemoryNetwork::new();
        let mut inbound = BTreeMap::new();
        let mut own = None;
        for i in 0..4u8 {
            let id = format!("n{i}");
            let addr = format!("mem://{id}");
            registry.upsert_contact(&id, NodeKeypair::from_seed(&[i + 1; 32]).public_key(), &addr, GENESIS);
            let (transport, rx) = net.endpoint(&addr);
            if i == 0 {
                own = Some(transport);
            }
            inbound.insert(id, rx);
        }
        let events = EventBus::default();
        let schedule = Arc::new(LeaderSchedule::new(
            ScheduleConfig {
                slot_duration_ms: 2_000,
                slots_per_epoch: 8,
                max_forwarding_slots: 3,
                genesis_unix_ms: GENESIS,
            },
            clock.clone(),
            registry.clone(),
            LeaderSelector::default(),
            events.clone(),
        ));
        schedule.advance().unwrap();
        let outbox = Outbox::new("n0".into(), Arc::new(own.unwrap()), 8, clock.clone());
        let forwarder = GulfStreamForwarder::new(
            GulfStreamConfig::default(),
            schedule.clone(),
            registry,
            outbox,
            clock.clone(),
            events.clone(),
        );
        Harness {
            forwarder,
            schedule,
            clock,
            net,
            inbound,
            events,
        }
    }

    fn tx() -> Transaction {
        Transaction::new_signed(&NodeKeypair::from_seed(&[9; 32]), b"transfer".to_vec(), 1)
    }

    #[tokio::test]
    async fn forwards_inv_to_every_remote_target() {
        let mut h = harness();
        let tx = tx();
        let report = h.forwarder.forward(&tx).await;

        assert_eq!(h.schedule.gulf_stream_targets().len(), 4);
        assert_eq!(report.delivered.len(), 3);
        assert_eq!(report.skipped, vec!["n0".to_string()]);
        assert!(report.failed.is_empty());

        for peer in ["n1", "n2", "n3"] {
            let (from, bytes) = h.inbound.get_mut(peer).unwrap().recv().await.unwrap();
            assert_eq!(from, "mem://n0");
            let env = Envelope::decode(&bytes).unwrap();
            assert_eq!(
                env.kind,
                MessageKind::Inv {
                    items: vec![InventoryItem::tx(tx.id)]
                }
            );
        }
        assert_eq!(h.forwarder.stats().forwarded, 3);
    }

    #[tokio::test]
    async fn forwarding_twice_is_idempotent() {
        let h = harness();
        let tx = tx();
        h.forwarder.forward(&tx).await;
        let again = h.forwarder.forward(&tx).await;
        assert!(again.delivered.is_empty());
        assert_eq!(again.skipped.len(), 4);
        assert!(h.forwarder.retry_pending().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_target_is_retried_next_slot() {
        let h = harness();
        let mut events = h.events.subscribe();
        h.net.set_down("mem://n2", true);

        let tx = tx();
        let report = h.forwarder.forward(&tx).await;
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "n2");

        let mut saw_unreachable = false;
        while let Ok(event) = events.try_recv() {
            if let ConsensusEvent::ForwardUnreachable { target, .. } = event {
                assert_eq!(target, "n2");
                saw_unreachable = true;
            }
        }
        assert!(saw_unreachable);

        h.net.set_down("mem://n2", false);
        h.clock.advance(2_000);
        let retries = h.forwarder.retry_pending().await;
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].delivered, vec!["n2".to_string()]);
        assert_eq!(h.forwarder.record(&tx.id).unwrap().delivered.len(), 3);
    }

    #[tokio::test]
    async fn sends_for_a_past_slot_are_abandoned() {
        let h = harness();
        let tx = tx();
        h.clock.advance(2_000);
        let report = h.forwarder.forward_in_slot(tx.id, 0).await;
        assert!(report.delivered.is_empty());
        assert_eq!(report.abandoned.len(), 3);
        assert_eq!(h.forwarder.stats().abandoned, 3);
        // Still pending, so the next slot picks it up.
        assert_eq!(h.forwarder.retry_pending().await[0].delivered.len(), 3);
    }

    #[tokio::test]
    async fn confirmation_and_expiry_drop_records() {
        let h = harness();
        let a = tx();
        let b = Transaction::new_signed(&NodeKeypair::from_seed(&[8; 32]), b"other".to_vec(), 2);
        h.forwarder.forward(&a).await;
        h.forwarder.forward(&b).await;
        assert_eq!(h.forwarder.pending_count(), 2);

        h.forwarder.mark_confirmed(&[a.id]);
        assert!(h.forwarder.record(&a.id).is_none());

        h.clock.advance(DEFAULT_FORWARD_TTL_MS + 1);
        assert_eq!(h.forwarder.purge_expired(), 1);
        assert_eq!(h.forwarder.pending_count(), 0);
    }
}
