//! Leader selection and slot timing.
//!
//! - [`registry`]: who is in the cluster and how well they are doing.
//! - [`selector`]: QUBO scoring plus simulated annealing over a snapshot.
//! - [`schedule`]: the per-epoch slot → leader table.
//! - [`poh`]: the Proof-of-History hash chain.
//! - [`clock`]: wall-clock and slot arithmetic.

pub mod clock;
pub mod poh;
pub mod registry;
pub mod schedule;
pub mod selector;

pub use clock::{Clock, ManualClock, SlotClock, SystemClock};
pub use poh::{verify_entries, PohConfig, PohEntry, PohError, PohSequencer};
pub use registry::{
    MetricsUpdate, NodeId, NodeRecord, NodeRegistry, RegistryConfig, RegistryError,
    RegistrySnapshot,
};
pub use schedule::{
    EpochPhase, LeaderSchedule, LeaderScheduleTable, ScheduleConfig, ScheduleError,
    SchedulePublisher,
};
pub use selector::{LeaderSelector, ScoreSnapshot, Selection, SelectorConfig, SelectorError};
