//! # Network Module
//!
//! Everything that moves data between QUASAR nodes, and the node runtime
//! that drives it.
//!
//! ## Architecture
//!
//! ```text
//! message.rs     - Wire envelope, message kinds, INV/GETDATA items, dedup window
//! transport.rs   - Transport trait, in-memory network, bounded outbox
//! mempool.rs     - TransactionPool trait + in-memory pool
//! gulf_stream.rs - Forwarding of new transactions to upcoming leaders
//! shred.rs       - Block <-> fixed-size shreds
//! turbine.rs     - Fanout tree, shred relay and reassembly
//! gossip.rs      - CRDS table, push/pull/prune, peer liveness
//! node.rs        - ConsensusNode: wiring, slot/gossip/inbound loops
//! ```
//!
//! ## Design Decisions
//!
//! - Components never do I/O themselves. They return [`Outbound`] messages
//!   (or call the shared [`Outbox`]) and the node sends them, so each one is
//!   testable without a network.
//! - The transport is a trait. The protocol crate ships an in-memory one;
//!   the node binary plugs in TCP.
//! - Every send goes through one semaphore-bounded [`Outbox`], which caps
//!   in-flight work for the whole node.

pub mod gossip;
pub mod gulf_stream;
pub mod mempool;
pub mod message;
pub mod node;
pub mod shred;
pub mod transport;
pub mod turbine;

pub use gossip::{
    ContactInfo, CrdsDigestItem, CrdsEntry, CrdsKey, CrdsKind, CrdsTable, CrdsValue, GossipConfig,
    GossipError, GossipService, MergeOutcome, PeerHealth,
};
pub use gulf_stream::{
    ForwardReport, ForwardStats, ForwardingRecord, GulfStreamConfig, GulfStreamForwarder,
};
pub use mempool::{Mempool, MempoolConfig, MempoolError, TransactionPool};
pub use message::{
    Envelope, InventoryItem, InventoryKind, MessageDeduplicator, MessageError, MessageKind,
    Outbound,
};
pub use node::{ConsensusNode, NodeError};
pub use shred::{Shred, ShredCodec, ShredError};
pub use transport::{Inbound, MemoryNetwork, MemoryTransport, Outbox, Transport, TransportError};
pub use turbine::{
    children, tree_order, Broadcast, ExpiredBlock, ShredReceipt, TurbineConfig,
    TurbineDisseminator,
};
