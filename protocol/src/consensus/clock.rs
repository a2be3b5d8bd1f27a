//! Wall-clock time and slot arithmetic.
//!
//! Leadership in QUASAR is a pure function of wall-clock time and the
//! published schedule, so every component that needs "now" gets it from a
//! [`Clock`] handle instead of calling the system clock directly. Production
//! uses [`SystemClock`]; tests use [`ManualClock`] and jump straight to
//! t = 121 s without waiting two minutes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of unix-millisecond timestamps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        // Pre-1970 clocks are not a case we entertain.
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Slot and epoch arithmetic on top of a [`Clock`].
///
/// `slot = floor((now - genesis) / slot_duration)`, `epoch = slot /
/// slots_per_epoch`. Before genesis the slot is 0.
#[derive(Clone)]
pub struct SlotClock {
    clock: Arc<dyn Clock>,
    genesis_ms: u64,
    slot_duration_ms: u64,
    slots_per_epoch: u64,
}

impl SlotClock {
    /// Zero durations are clamped to 1 so the arithmetic never divides by
    /// zero; `NodeConfig::validate` rejects them long before this point.
    pub fn new(
        clock: Arc<dyn Clock>,
        genesis_ms: u64,
        slot_duration_ms: u64,
        slots_per_epoch: u64,
    ) -> Self {
        Self {
            clock,
            genesis_ms,
            slot_duration_ms: slot_duration_ms.max(1),
            slots_per_epoch: slots_per_epoch.max(1),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn current_slot(&self) -> u64 {
        self.slot_at(self.clock.now_ms())
    }

    pub fn slot_at(&self, unix_ms: u64) -> u64 {
        unix_ms.saturating_sub(self.genesis_ms) / self.slot_duration_ms
    }

    pub fn epoch_of(&self, slot: u64) -> u64 {
        slot / self.slots_per_epoch
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch_of(self.current_slot())
    }

    pub fn epoch_start_slot(&self, epoch: u64) -> u64 {
        epoch.saturating_mul(self.slots_per_epoch)
    }

    /// Last slot belonging to `epoch`.
    pub fn epoch_last_slot(&self, epoch: u64) -> u64 {
        self.epoch_start_slot(epoch) + self.slots_per_epoch - 1
    }

    pub fn slot_start_ms(&self, slot: u64) -> u64 {
        self.genesis_ms + slot.saturating_mul(self.slot_duration_ms)
    }

    pub fn slots_per_epoch(&self) -> u64 {
        self.slots_per_epoch
    }

    pub fn slot_duration_ms(&self) -> u64 {
        self.slot_duration_ms
    }
}

impl std::fmt::Debug for SlotClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotClock")
            .field("genesis_ms", &self.genesis_ms)
            .field("slot_duration_ms", &self.slot_duration_ms)
            .field("slots_per_epoch", &self.slots_per_epoch)
            .finish()
    }
}
