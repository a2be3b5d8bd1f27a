//! # Transport
//!
//! The protocol crate never opens a socket. It talks to a [`Transport`]:
//! "send these bytes to that address", plus an inbound stream of
//! `(sender_addr, bytes)` delivered over an mpsc channel. The node binary
//! plugs in TCP; tests plug in [`MemoryNetwork`], which can also take
//! endpoints down to simulate partitions.
//!
//! [`Outbox`] sits on top: it wraps a message in an [`Envelope`], encodes
//! it, and sends it while holding a semaphore permit, so the number of
//! in-flight sends is bounded no matter how many components are talking.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

use super::message::{Envelope, MessageKind};
use crate::consensus::clock::Clock;
use crate::consensus::registry::NodeId;

/// Capacity of each in-memory endpoint's inbound queue.
const MEMORY_ENDPOINT_CAPACITY: usize = 4_096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("transport i/o error: {0}")]
    Io(String),

    #[error("transport is closed")]
    Closed,
}

/// Inbound side of a transport: `(sender_addr, bytes)`.
pub type Inbound = mpsc::Receiver<(String, Bytes)>;

/// Point-to-point byte delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, addr: &str, bytes: Bytes) -> Result<(), TransportError>;

    /// The address peers should use to reach us.
    fn local_addr(&self) -> String;
}

// ---------------------------------------------------------------------------
// In-memory network
// ---------------------------------------------------------------------------

/// A set of in-process endpoints wired together by address.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: DashMap<String, mpsc::Sender<(String, Bytes)>>,
    down: DashSet<String>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (or replace) the endpoint at `addr`.
    pub fn endpoint(self: &Arc<Self>, addr: &str) -> (MemoryTransport, Inbound) {
        let (tx, rx) = mpsc::channel(MEMORY_ENDPOINT_CAPACITY);
        self.endpoints.insert(addr.to_string(), tx);
        let transport = MemoryTransport {
            network: Arc::clone(self),
            addr: addr.to_string(),
        };
        (transport, rx)
    }

    /// Mark an endpoint unreachable (both directions) or bring it back.
    pub fn set_down(&self, addr: &str, down: bool) {
        if down {
            self.down.insert(addr.to_string());
        } else {
            self.down.remove(addr);
        }
    }

    pub fn is_down(&self, addr: &str) -> bool {
        self.down.contains(addr)
    }
}

/// One endpoint of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    addr: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, addr: &str, bytes: Bytes) -> Result<(), TransportError> {
        if self.network.is_down(&self.addr) || self.network.is_down(addr) {
            return Err(TransportError::Unreachable(addr.to_string()));
        }
        let sender = self
            .network
            .endpoints
            .get(addr)
            .map(|s| s.clone())
            .ok_or_else(|| TransportError::Unreachable(addr.to_string()))?;
        sender
            .send((self.addr.clone(), bytes))
            .await
            .map_err(|_| TransportError::Unreachable(addr.to_string()))
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Envelope-wrapping, concurrency-bounded sender shared by every component
/// of one node.
#[derive(Clone)]
pub struct Outbox {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
}

impl Outbox {
    pub fn new(
        node_id: NodeId,
        transport: Arc<dyn Transport>,
        max_inflight: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            node_id,
            transport,
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            clock,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn local_addr(&self) -> String {
        self.transport.local_addr()
    }

    /// Wrap `kind` in an envelope stamped with our identity and clock.
    pub fn envelope(&self, kind: MessageKind) -> Envelope {
        Envelope::new(
            self.node_id.clone(),
            self.transport.local_addr(),
            self.clock.now_ms(),
            kind,
        )
    }

    /// Send and wait for the transport's verdict.
    pub async fn send(&self, addr: &str, kind: MessageKind) -> Result<(), TransportError> {
        let name = kind.name();
        let bytes = self
            .envelope(kind)
            .encode()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;
        trace!(to = addr, kind = name, bytes = bytes.len(), "sending");
        self.transport.send(addr, Bytes::from(bytes)).await
    }

    /// Fire and forget. Failures are logged at debug; callers that care
    /// about the outcome use [`send`](Self::send).
    pub fn spawn_send(&self, addr: String, kind: MessageKind) {
        let outbox = self.clone();
        tokio::spawn(async move {
            let name = kind.name();
            if let Err(e) = outbox.send(&addr, kind).await {
                debug!(to = %addr, kind = name, error = %e, "send failed");
            }
        });
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}
