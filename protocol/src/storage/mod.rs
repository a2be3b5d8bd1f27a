//! # Storage Module
//!
//! Blocks and the chain they form.
//!
//! ```text
//! block.rs  - Block structure, genesis block, hash/sign/verify, bincode codec
//! chain.rs  - ChainStore collaborator trait + in-memory implementation
//! ```
//!
//! Persistence is deliberately not here. The consensus core talks to a
//! [`ChainStore`]; whoever embeds it decides whether blocks end up on disk.

pub mod block;
pub mod chain;

pub use block::{Block, BlockError, BlockHeader};
pub use chain::{ChainError, ChainStore, InMemoryChain};
