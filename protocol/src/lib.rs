// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # QUASAR Protocol: Consensus Core
//!
//! QUASAR is a permissioned, Solana-style consensus core: a known set of
//! nodes takes turns leading slots, transactions are pushed to the leaders
//! who will include them before their turn comes, and blocks fan out over
//! a tree instead of being flooded.
//!
//! ## Architecture
//!
//! - **crypto** - Ed25519 identities, BLAKE3 and SHA-256. Nothing clever.
//! - **transaction** - Signed opaque payloads with content-derived ids.
//! - **storage** - Blocks and the `ChainStore` they are appended to.
//! - **consensus** - Node registry, QUBO/annealing leader selector, the
//!   per-epoch leader schedule, Proof of History, clocks.
//! - **network** - Wire messages, transport, mempool, Gulf Stream, Turbine,
//!   CRDS gossip, and the `ConsensusNode` that drives them all.
//! - **events** - The broadcast channel local failures are reported on.
//! - **config** - Protocol constants and the node configuration.
//!
//! ## Design Philosophy
//!
//! 1. Leadership is a local lookup. Nobody votes on who leads slot N.
//! 2. Deterministic inputs, deterministic schedules: same snapshot, same table.
//! 3. Components return what they want sent; the node does the sending.
//! 4. Local failures are logged and published, never fatal. Except PoH.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod events;
pub mod network;
pub mod storage;
pub mod transaction;

pub use network::node::{ConsensusNode, NodeError};
