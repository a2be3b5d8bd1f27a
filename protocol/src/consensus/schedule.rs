//! # Leader Schedule
//!
//! Who leads which slot. The schedule is a table per epoch, computed from
//! a registry snapshot by the [`LeaderSelector`], published as an
//! immutable `Arc` and replaced wholesale when the next epoch begins.
//! Readers clone the `Arc` under a read lock, so a lookup sees either the
//! old table or the new one, never half of each.
//!
//! ## Epoch lifecycle
//!
//! ```text
//!   Computing ──► Published ──► Expiring ──► (next epoch) Computing …
//!       │             ▲             │
//!       │             │             └── next table precomputed + published
//!       └─ EmptyRegistry: prior table retained, retried next slot
//! ```
//!
//! The slot timer calls [`LeaderSchedule::advance`] once per slot. Entering
//! a new epoch promotes the precomputed table if there is one, or computes
//! it on the spot. In the last `max_forwarding_slots + 1` slots of an epoch
//! the schedule goes `Expiring` and precomputes the next table, so gulf
//! stream lookups that cross the epoch boundary have something to read.
//!
//! ## Convergence
//!
//! Every node computes its own table from its own registry, and registries
//! are fed by local pings, so two nodes *can* disagree. Each publishes its
//! table through gossip; each installs the tables it receives. For a given
//! epoch, non-degraded beats degraded and then the lowest table digest
//! wins. Once gossip has spread every candidate, every node holds the same
//! winner.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::clock::{Clock, SlotClock};
use super::registry::{NodeId, NodeRegistry};
use super::selector::LeaderSelector;
use crate::config::{
    DEFAULT_MAX_FORWARDING_SLOTS, DEFAULT_SLOTS_PER_EPOCH, DEFAULT_SLOT_DURATION_MS,
    GENESIS_UNIX_MS,
};
use crate::crypto::{blake3_hash, short_hex, Hash, PublicKey};
use crate::events::{ConsensusEvent, EventBus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no registered nodes to schedule")]
    EmptyRegistry,

    #[error("schedule table for epoch {epoch} is malformed: {reason}")]
    InvalidTable { epoch: u64, reason: String },

    #[error("schedule table for epoch {epoch} is neither current nor next")]
    StaleTable { epoch: u64 },
}

/// Slot and epoch geometry. Must be identical across the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub slot_duration_ms: u64,
    pub slots_per_epoch: u64,
    /// Upcoming leaders (beyond the current one) gulf stream targets.
    pub max_forwarding_slots: usize,
    pub genesis_unix_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            slot_duration_ms: DEFAULT_SLOT_DURATION_MS,
            slots_per_epoch: DEFAULT_SLOTS_PER_EPOCH,
            max_forwarding_slots: DEFAULT_MAX_FORWARDING_SLOTS,
            genesis_unix_ms: GENESIS_UNIX_MS,
        }
    }
}

/// Where the current epoch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochPhase {
    Computing,
    Published,
    Expiring,
}

// ---------------------------------------------------------------------------
// LeaderScheduleTable
// ---------------------------------------------------------------------------

/// One epoch's slot → leader map. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderScheduleTable {
    pub epoch: u64,
    pub start_slot: u64,
    /// Exactly one leader per slot of the epoch.
    pub leaders: Vec<NodeId>,
    /// Public key of every node appearing in `leaders`; blocks are checked
    /// against these.
    pub leader_keys: BTreeMap<NodeId, PublicKey>,
    /// Content hash of the registry snapshot the table was computed from.
    pub snapshot_hash: Hash,
    /// Computed by the fallback sort after a selection timeout.
    pub degraded: bool,
}

impl LeaderScheduleTable {
    /// One past the last slot this table covers.
    pub fn end_slot(&self) -> u64 {
        self.start_slot + self.leaders.len() as u64
    }

    pub fn covers(&self, slot: u64) -> bool {
        slot >= self.start_slot && slot < self.end_slot()
    }

    pub fn leader_at(&self, slot: u64) -> Option<&NodeId> {
        if !self.covers(slot) {
            return None;
        }
        self.leaders.get((slot - self.start_slot) as usize)
    }

    /// Treat the table as repeating past its end. Used for a retained table
    /// when the next epoch could not be computed.
    pub fn leader_wrapping(&self, slot: u64) -> Option<&NodeId> {
        if slot < self.start_slot || self.leaders.is_empty() {
            return None;
        }
        let offset = (slot - self.start_slot) % self.leaders.len() as u64;
        self.leaders.get(offset as usize)
    }

    pub fn key_of(&self, node_id: &str) -> Option<&PublicKey> {
        self.leader_keys.get(node_id)
    }

    pub fn distinct_leaders(&self) -> usize {
        self.leaders.iter().collect::<BTreeSet<_>>().len()
    }

    /// BLAKE3 over the bincode encoding. Drives the convergence rule.
    pub fn digest(&self) -> Hash {
        // A plain struct of strings, integers and byte arrays always encodes.
        let bytes = bincode::serialize(self).unwrap_or_default();
        blake3_hash(&bytes)
    }

    /// `true` if `self` should replace `other` for the same epoch.
    pub fn preferred_over(&self, other: &LeaderScheduleTable) -> bool {
        (self.degraded, self.digest()) < (other.degraded, other.digest())
    }

    /// Shape checks for a table that came off the wire.
    pub fn validate(&self, slots_per_epoch: u64) -> Result<(), ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidTable {
            epoch: self.epoch,
            reason,
        };
        if self.leaders.len() as u64 != slots_per_epoch {
            return Err(invalid("leader count does not match slots_per_epoch".into()));
        }
        if self.start_slot != self.epoch.saturating_mul(slots_per_epoch) {
            return Err(invalid("start_slot does not match epoch".into()));
        }
        if let Some(missing) = self.leaders.iter().find(|id| !self.leader_keys.contains_key(*id)) {
            return Err(invalid(format!("no public key for leader {missing}")));
        }
        Ok(())
    }
}

/// Something that can spread a freshly computed table. The gossip service
/// implements it; tests plug in a recorder.
pub trait SchedulePublisher: Send + Sync {
    fn publish_schedule(&self, table: &LeaderScheduleTable);
}

// ---------------------------------------------------------------------------
// LeaderSchedule
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ScheduleState {
    current: Option<Arc<LeaderScheduleTable>>,
    next: Option<Arc<LeaderScheduleTable>>,
    phase: EpochPhase,
}

/// The live schedule service.
pub struct LeaderSchedule {
    config: ScheduleConfig,
    clock: SlotClock,
    registry: Arc<NodeRegistry>,
    selector: LeaderSelector,
    events: EventBus,
    publisher: RwLock<Option<Arc<dyn SchedulePublisher>>>,
    state: RwLock<ScheduleState>,
}

impl LeaderSchedule {
    pub fn new(
        config: ScheduleConfig,
        clock: Arc<dyn Clock>,
        registry: Arc<NodeRegistry>,
        selector: LeaderSelector,
        events: EventBus,
    ) -> Self {
        let slot_clock = SlotClock::new(
            clock,
            config.genesis_unix_ms,
            config.slot_duration_ms,
            config.slots_per_epoch,
        );
        Self {
            config,
            clock: slot_clock,
            registry,
            selector,
            events,
            publisher: RwLock::new(None),
            state: RwLock::new(ScheduleState {
                current: None,
                next: None,
                phase: EpochPhase::Computing,
            }),
        }
    }

    /// Wire the gossip side in after construction (gossip needs the node's
    /// identity, which is built later than the schedule).
    pub fn set_publisher(&self, publisher: Arc<dyn SchedulePublisher>) {
        *self.publisher.write() = Some(publisher);
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn slot_clock(&self) -> &SlotClock {
        &self.clock
    }

    // -- lookups -----------------------------------------------------------

    pub fn current_slot(&self) -> u64 {
        self.clock.current_slot()
    }

    pub fn current_epoch(&self) -> u64 {
        self.clock.current_epoch()
    }

    pub fn phase(&self) -> EpochPhase {
        self.state.read().phase
    }

    pub fn current_table(&self) -> Option<Arc<LeaderScheduleTable>> {
        self.state.read().current.clone()
    }

    pub fn next_table(&self) -> Option<Arc<LeaderScheduleTable>> {
        self.state.read().next.clone()
    }

    /// The leader for an arbitrary slot, consulting the current table, the
    /// precomputed next table, and finally the retained table repeated.
    pub fn leader_for_slot(&self, slot: u64) -> Option<NodeId> {
        let (current, next) = {
            let state = self.state.read();
            (state.current.clone(), state.next.clone())
        };
        lookup(current.as_deref(), next.as_deref(), slot).cloned()
    }

    /// Public key of the leader scheduled for `slot`.
    pub fn leader_key_for_slot(&self, slot: u64) -> Option<(NodeId, PublicKey)> {
        let (current, next) = {
            let state = self.state.read();
            (state.current.clone(), state.next.clone())
        };
        let id = lookup(current.as_deref(), next.as_deref(), slot)?;
        let key = next
            .as_deref()
            .filter(|t| t.covers(slot))
            .or(current.as_deref())
            .and_then(|t| t.key_of(id))?;
        Some((id.clone(), key.clone()))
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.leader_for_slot(self.current_slot())
    }

    /// The next `k` distinct leaders after the current slot, excluding the
    /// current leader. May return fewer if the schedule runs out or the
    /// cluster is smaller than `k + 1`.
    pub fn upcoming_leaders(&self, k: usize) -> Vec<NodeId> {
        let slot = self.current_slot();
        self.upcoming_from(slot, k)
    }

    fn upcoming_from(&self, slot: u64, k: usize) -> Vec<NodeId> {
        if k == 0 {
            return Vec::new();
        }
        let (current, next) = {
            let state = self.state.read();
            (state.current.clone(), state.next.clone())
        };
        let current_leader = lookup(current.as_deref(), next.as_deref(), slot);

        let mut seen: BTreeSet<&NodeId> = current_leader.into_iter().collect();
        let mut upcoming = Vec::with_capacity(k);
        let horizon = 2 * self.config.slots_per_epoch.max(1);
        for offset in 1..=horizon {
            let Some(leader) = lookup(current.as_deref(), next.as_deref(), slot + offset) else {
                break;
            };
            if seen.insert(leader) {
                upcoming.push(leader.clone());
                if upcoming.len() == k {
                    break;
                }
            }
        }
        upcoming
    }

    /// Current leader plus the next `max_forwarding_slots` distinct
    /// upcoming leaders. The one place the forwarding bound is enforced:
    /// `len == 1 + min(max_forwarding_slots, upcoming_available)`.
    pub fn gulf_stream_targets(&self) -> Vec<NodeId> {
        let slot = self.current_slot();
        let Some(current) = self.leader_for_slot(slot) else {
            return Vec::new();
        };
        let mut targets = vec![current];
        targets.extend(self.upcoming_from(slot, self.config.max_forwarding_slots));
        targets
    }

    // -- lifecycle ---------------------------------------------------------

    /// Build the table for `epoch` from the current registry. Pure with
    /// respect to the schedule state: nothing is installed.
    pub fn compute_epoch(&self, epoch: u64) -> Result<LeaderScheduleTable, ScheduleError> {
        let snapshot = self.registry.snapshot();
        let selection = self
            .selector
            .rank(&snapshot)
            .map_err(|_| ScheduleError::EmptyRegistry)?;

        if selection.degraded {
            self.events.emit(ConsensusEvent::SelectionTimeout {
                epoch,
                budget_ms: self.selector.config().time_budget_ms,
                elapsed_ms: selection.elapsed.as_millis() as u64,
            });
        }

        let leaders = LeaderSelector::assign_slots(&selection.ranking, self.config.slots_per_epoch);
        let leader_keys = leaders
            .iter()
            .filter_map(|id| snapshot.get(id).map(|r| (id.clone(), r.public_key.clone())))
            .collect();

        Ok(LeaderScheduleTable {
            epoch,
            start_slot: self.clock.epoch_start_slot(epoch),
            leaders,
            leader_keys,
            snapshot_hash: snapshot.content_hash(),
            degraded: selection.degraded,
        })
    }

    /// Drive the lifecycle for the current wall-clock slot. Returns the new
    /// current table when one was installed by this call.
    pub fn advance(&self) -> Result<Option<Arc<LeaderScheduleTable>>, ScheduleError> {
        let slot = self.current_slot();
        let epoch = self.clock.epoch_of(slot);

        let needs_table = match self.current_table() {
            Some(table) => table.epoch < epoch,
            None => true,
        };

        if needs_table {
            return self.enter_epoch(epoch).map(Some);
        }

        let last_slot = self.clock.epoch_last_slot(epoch);
        let lookahead = self.config.max_forwarding_slots as u64;
        if slot >= last_slot.saturating_sub(lookahead) {
            self.prepare_next(epoch + 1);
        }
        Ok(None)
    }

    fn enter_epoch(&self, epoch: u64) -> Result<Arc<LeaderScheduleTable>, ScheduleError> {
        // Promote a precomputed (or gossiped) table for this epoch.
        {
            let mut state = self.state.write();
            if let Some(next) = state.next.take() {
                if next.epoch == epoch {
                    state.current = Some(next.clone());
                    state.phase = EpochPhase::Published;
                    info!(epoch, leaders = next.distinct_leaders(), "promoted precomputed leader schedule");
                    return Ok(next);
                }
                if next.epoch > epoch {
                    state.next = Some(next);
                }
            }
            state.phase = EpochPhase::Computing;
        }

        match self.compute_epoch(epoch) {
            Ok(table) => Ok(self.commit_local(table, false)),
            Err(err) => {
                let mut state = self.state.write();
                if state.current.is_some() {
                    state.phase = EpochPhase::Published;
                }
                drop(state);
                warn!(epoch, error = %err, "leader schedule computation failed, keeping prior table");
                self.events.emit(ConsensusEvent::ScheduleFailed {
                    epoch,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn prepare_next(&self, epoch: u64) {
        {
            let mut state = self.state.write();
            state.phase = EpochPhase::Expiring;
            if state.next.as_ref().is_some_and(|t| t.epoch == epoch) {
                return;
            }
        }
        match self.compute_epoch(epoch) {
            Ok(table) => {
                self.commit_local(table, true);
                debug!(epoch, "precomputed next leader schedule");
            }
            Err(err) => {
                debug!(epoch, error = %err, "could not precompute next schedule");
            }
        }
    }

    /// Store a table we computed ourselves in the current (or next) slot
    /// and publish it. Selection runs without the state lock, so gossip may
    /// have installed a table for the same epoch in the meantime; if that
    /// one wins the convergence rule it stays and ours is dropped unpublished.
    /// Returns whichever table is held afterwards.
    fn commit_local(&self, table: LeaderScheduleTable, next: bool) -> Arc<LeaderScheduleTable> {
        let table = Arc::new(table);
        let kept = {
            let mut state = self.state.write();
            if !next {
                state.phase = EpochPhase::Published;
            }
            let held = if next { &mut state.next } else { &mut state.current };
            let keep_held = held.as_deref().is_some_and(|h| {
                h.epoch > table.epoch || (h.epoch == table.epoch && h.preferred_over(&table))
            });
            if keep_held {
                held.clone()
            } else {
                *held = Some(table.clone());
                None
            }
        };
        match kept {
            Some(held) => {
                debug!(
                    epoch = table.epoch,
                    kept = %short_hex(&held.digest()),
                    "preferred schedule arrived during selection, local table dropped"
                );
                held
            }
            None => {
                self.publish(&table);
                table
            }
        }
    }

    fn publish(&self, table: &Arc<LeaderScheduleTable>) {
        info!(
            epoch = table.epoch,
            start_slot = table.start_slot,
            leaders = table.distinct_leaders(),
            degraded = table.degraded,
            snapshot = %short_hex(&table.snapshot_hash),
            "published leader schedule"
        );
        self.events.emit(ConsensusEvent::SchedulePublished {
            epoch: table.epoch,
            distinct_leaders: table.distinct_leaders(),
            degraded: table.degraded,
        });
        let publisher = self.publisher.read().clone();
        if let Some(publisher) = publisher {
            publisher.publish_schedule(table);
        }
    }

    /// Adopt a table received through gossip.
    ///
    /// Tables for the current wall-clock epoch go into the current slot,
    /// tables for the following epoch into the next slot. Either replaces
    /// what is there only if it is for a newer epoch or wins the
    /// convergence rule. Returns `Ok(true)` if the table was installed.
    pub fn install_table(&self, table: LeaderScheduleTable, origin: &str) -> Result<bool, ScheduleError> {
        table.validate(self.config.slots_per_epoch)?;
        let epoch_now = self.current_epoch();

        let mut state = self.state.write();
        let slot = if table.epoch == epoch_now {
            &mut state.current
        } else if table.epoch == epoch_now + 1 {
            &mut state.next
        } else {
            return Err(ScheduleError::StaleTable { epoch: table.epoch });
        };

        let replace = match slot.as_deref() {
            None => true,
            Some(held) if held.epoch < table.epoch => true,
            Some(held) if held.epoch == table.epoch => table.preferred_over(held),
            Some(_) => false,
        };
        if !replace {
            return Ok(false);
        }

        let epoch = table.epoch;
        *slot = Some(Arc::new(table));
        if epoch == epoch_now {
            state.phase = EpochPhase::Published;
        }
        drop(state);

        info!(epoch, origin, "adopted gossiped leader schedule");
        self.events.emit(ConsensusEvent::ScheduleAdopted {
            epoch,
            origin: origin.to_string(),
        });
        Ok(true)
    }
}

fn lookup<'a>(
    current: Option<&'a LeaderScheduleTable>,
    next: Option<&'a LeaderScheduleTable>,
    slot: u64,
) -> Option<&'a NodeId> {
    if let Some(leader) = current.and_then(|t| t.leader_at(slot)) {
        return Some(leader);
    }
    if let Some(leader) = next.and_then(|t| t.leader_at(slot)) {
        return Some(leader);
    }
    match (current, next) {
        // Retained table, nothing newer: it stays active, repeating.
        (Some(t), None) if slot >= t.end_slot() => t.leader_wrapping(slot),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::clock::ManualClock;
    use crate::consensus::registry::MetricsUpdate;
    use crate::crypto::NodeKeypair;
    use parking_lot::Mutex;

    const GENESIS: u64 = 1_000_000;

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<u64>>,
    }

    impl SchedulePublisher for Recorder {
        fn publish_schedule(&self, table: &LeaderScheduleTable) {
            self.published.lock().push(table.epoch);
        }
    }

    fn registry_with(n: usize) -> Arc<NodeRegistry> {
        let registry = Arc::new(NodeRegistry::default());
        for i in 0..n {
            let id = format!("node{:03}", i);
            let mut seed = [0u8; 32];
            seed[..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
            registry.register(id.clone(), NodeKeypair::from_seed(&seed).public_key());
            registry
                .update_metrics(
                    &id,
                    MetricsUpdate {
                        // Strictly decreasing quality keeps the ranking obvious.
                        uptime: Some(1.0 - i as f64 / (n as f64 * 2.0)),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        registry
    }

    fn schedule(
        registry: Arc<NodeRegistry>,
        slots_per_epoch: u64,
    ) -> (LeaderSchedule, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(GENESIS));
        let config = ScheduleConfig {
            slot_duration_ms: 2_000,
            slots_per_epoch,
            max_forwarding_slots: 3,
            genesis_unix_ms: GENESIS,
        };
        let schedule = LeaderSchedule::new(
            config,
            clock.clone(),
            registry,
            LeaderSelector::default(),
            EventBus::default(),
        );
        (schedule, clock)
    }

    #[test]
    fn epoch_rollover_replaces_the_table() {
        let (schedule, clock) = schedule(registry_with(3), 60);
        let recorder = Arc::new(Recorder::default());
        schedule.set_publisher(recorder.clone());

        assert_eq!(schedule.current_slot(), 0);
        let first = schedule.advance().unwrap().expect("table for epoch 0");
        assert_eq!(first.epoch, 0);
        assert_eq!(first.leaders.len(), 60);
        assert_eq!(schedule.phase(), EpochPhase::Published);

        clock.set(GENESIS + 121_000);
        assert_eq!(schedule.current_slot(), 60);
        let second = schedule.advance().unwrap().expect("table for epoch 1");
        assert_eq!(second.epoch, 1);
        assert_eq!(second.start_slot, 60);
        assert!(!Arc::ptr_eq(&first, &schedule.current_table().unwrap()));
        assert_eq!(*recorder.published.lock(), vec![0, 1]);
    }

    #[test]
    fn advance_within_an_epoch_is_a_no_op() {
        let (schedule, clock) = schedule(registry_with(3), 60);
        schedule.advance().unwrap();
        clock.advance(10_000);
        assert!(schedule.advance().unwrap().is_none());
    }

    #[test]
    fn expiring_precomputes_next_epoch() {
        let (schedule, clock) = schedule(registry_with(3), 10);
        schedule.advance().unwrap();
        // Slot 6 is within max_forwarding_slots + 1 of slot 9.
        clock.set(GENESIS + 6 * 2_000);
        assert!(schedule.advance().unwrap().is_none());
        assert_eq!(schedule.phase(), EpochPhase::Expiring);
        let next = schedule.next_table().expect("next table");
        assert_eq!(next.epoch, 1);

        clock.set(GENESIS + 10 * 2_000);
        let promoted = schedule.advance().unwrap().unwrap();
        assert!(Arc::ptr_eq(&promoted, &next));
        assert!(schedule.next_table().is_none());
    }

    #[test]
    fn cross_boundary_lookups_use_next_table() {
        let (schedule, clock) = schedule(registry_with(3), 10);
        schedule.advance().unwrap();
        clock.set(GENESIS + 8 * 2_000);
        schedule.advance().unwrap();

        // Slot 11 lives in the next table.
        assert!(schedule.leader_for_slot(11).is_some());
        assert_eq!(schedule.gulf_stream_targets().len(), 3);
    }

    #[test]
    fn empty_registry_keeps_prior_table() {
        let registry = Arc::new(NodeRegistry::default());
        let (schedule, clock) = schedule(registry.clone(), 10);
        assert_eq!(schedule.advance().unwrap_err(), ScheduleError::EmptyRegistry);
        assert!(schedule.current_table().is_none());
        assert_eq!(schedule.phase(), EpochPhase::Computing);

        registry.register("only", NodeKeypair::from_seed(&[1; 32]).public_key());
        let table = schedule.advance().unwrap().unwrap();
        assert_eq!(table.leaders, vec!["only".to_string(); 10]);

        // Node goes stale: epoch 1 cannot be computed, epoch 0 stays active.
        registry.evict_stale(1, u64::MAX, "nobody");
        clock.set(GENESIS + 25 * 2_000);
        assert_eq!(schedule.advance().unwrap_err(), ScheduleError::EmptyRegistry);
        assert_eq!(schedule.current_table().unwrap().epoch, 0);
        assert_eq!(schedule.current_leader().as_deref(), Some("only"));
    }

    #[test]
    fn gulf_stream_targets_with_200_leaders() {
        let (schedule, _clock) = schedule(registry_with(200), 200);
        schedule.advance().unwrap();
        let targets = schedule.gulf_stream_targets();
        assert_eq!(targets.len(), 4);
        let distinct: BTreeSet<_> = targets.iter().collect();
        assert_eq!(distinct.len(), 4);
        assert_eq!(targets[0], schedule.current_leader().unwrap());
    }

    #[test]
    fn gulf_stream_targets_are_bounded_by_cluster_size() {
        let (schedule, _clock) = schedule(registry_with(2), 60);
        schedule.advance().unwrap();
        // 1 + min(3, 1 upcoming available)
        assert_eq!(schedule.gulf_stream_targets().len(), 2);
        assert_eq!(schedule.upcoming_leaders(0), Vec::<NodeId>::new());
    }

    #[test]
    fn no_table_means_no_targets() {
        let (schedule, _clock) = schedule(registry_with(3), 60);
        assert!(schedule.gulf_stream_targets().is_empty());
        assert!(schedule.current_leader().is_none());
    }

    #[test]
    fn identical_registries_give_identical_tables() {
        let (a, _) = schedule(registry_with(12), 30);
        let (b, _) = schedule(registry_with(12), 30);
        assert_eq!(a.compute_epoch(4).unwrap(), b.compute_epoch(4).unwrap());
    }

    #[test]
    fn install_table_follows_convergence_rule() {
        let (local, _) = schedule(registry_with(3), 10);
        local.advance().unwrap();
        let held = local.current_table().unwrap();

        // A table for the same epoch with different leaders.
        let (remote, _) = schedule(registry_with(4), 10);
        let candidate = remote.compute_epoch(0).unwrap();
        let expected = candidate.preferred_over(&held);
        assert_eq!(local.install_table(candidate.clone(), "remote").unwrap(), expected);

        // Whatever happened, installing the loser again changes nothing and
        // both orders end on the same table.
        let winner = if expected { candidate.clone() } else { (*held).clone() };
        let _ = local.install_table((*held).clone(), "self");
        let _ = local.install_table(candidate, "remote");
        assert_eq!(*local.current_table().unwrap(), winner);
    }

    #[test]
    fn install_table_rejects_old_and_malformed() {
        let (schedule, clock) = schedule(registry_with(3), 10);
        let old = schedule.compute_epoch(0).unwrap();
        clock.set(GENESIS + 40 * 2_000);
        assert_eq!(
            schedule.install_table(old, "x").unwrap_err(),
            ScheduleError::StaleTable { epoch: 0 }
        );

        let mut bad = schedule.compute_epoch(4).unwrap();
        bad.leaders.pop();
        assert!(matches!(
            schedule.install_table(bad, "x"),
            Err(ScheduleError::InvalidTable { .. })
        ));

        let next = schedule.compute_epoch(5).unwrap();
        assert!(schedule.install_table(next, "x").unwrap());
        assert_eq!(schedule.next_table().unwrap().epoch, 5);
    }

    #[test]
    fn leader_key_lookup_matches_registry() {
        let registry = registry_with(3);
        let (schedule, _) = schedule(registry.clone(), 10);
        schedule.advance().unwrap();
        let (id, key) = schedule.leader_key_for_slot(0).unwrap();
        assert_eq!(registry.get(&id).unwrap().public_key, key);
    }

    #[test]
    fn gossiped_table_installed_during_selection_is_kept() {
        let (local, _) = schedule(registry_with(3), 10);
        let recorder = Arc::new(Recorder::default());
        local.set_publisher(recorder.clone());

        let a = local.compute_epoch(0).unwrap();
        let (other, _) = schedule(registry_with(4), 10);
        let b = other.compute_epoch(0).unwrap();
        let (winner, loser) = if a.preferred_over(&b) { (a, b) } else { (b, a) };

        // Gossip lands the winner while the loser is still being computed.
        assert!(local.install_table(winner.clone(), "remote").unwrap());
        let held = local.commit_local(loser, false);
        assert_eq!(*held, winner);
        assert_eq!(*local.current_table().unwrap(), winner);
        assert!(recorder.published.lock().is_empty());
        assert_eq!(local.phase(), EpochPhase::Published);
    }

    #[test]
    fn local_table_replaces_a_losing_gossiped_one() {
        let (local, _) = schedule(registry_with(3), 10);
        let recorder = Arc::new(Recorder::default());
        local.set_publisher(recorder.clone());

        let a = local.compute_epoch(1).unwrap();
        let (other, _) = schedule(registry_with(4), 10);
        let b = other.compute_epoch(1).unwrap();
        let (winner, loser) = if a.preferred_over(&b) { (a, b) } else { (b, a) };

        assert!(local.install_table(loser, "remote").unwrap());
        let held = local.commit_local(winner.clone(), true);
        assert_eq!(*held, winner);
        assert_eq!(*local.next_table().unwrap(), winner);
        assert_eq!(*recorder.published.lock(), vec![1]);
    }
}
