//! # TCP Transport
//!
//! The production [`Transport`]: one outbound TCP connection per peer
//! address, reused across sends, and a listener that turns every inbound
//! connection into a stream of frames on the node's inbound queue.
//!
//! ## Wire format
//!
//! ```text
//! ┌───────────────┬───────────────┬──────────────────────────────┐
//! │ 4 bytes (BE)  │ 4 bytes (BE)  │  payload (bincode Envelope)  │
//! │ PROTOCOL_MAGIC│ payload len   │                              │
//! └───────────────┴───────────────┴──────────────────────────────┘
//! ```
//!
//! The magic lets a listener drop non-QUASAR connections at the first
//! frame. Frames above `max_frame_size` close the connection.
//!
//! A send (connect included) that has not finished within `send_timeout`
//! is abandoned and its connection dropped, since a half-written frame
//! leaves the stream unusable. A peer that stops reading therefore costs
//! one timeout per send, not a stuck sender.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quasar_protocol::config::PROTOCOL_MAGIC;
use quasar_protocol::network::{Inbound, Transport, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, trace, warn};

/// Frame header: magic plus payload length.
const FRAME_HEADER_LEN: usize = 8;

/// Capacity of the inbound queue shared by all connections.
const INBOUND_QUEUE_CAPACITY: usize = 8_192;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, TransportError> {
    if payload.len() > max_frame_size {
        return Err(TransportError::Io(format!(
            "frame of {} bytes exceeds the {max_frame_size} byte limit",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read one frame. `Ok(None)` is a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Io(e.to_string())),
    }

    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != PROTOCOL_MAGIC {
        return Err(TransportError::Io(format!("bad frame magic {magic:#010x}")));
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > max_frame_size {
        return Err(TransportError::Io(format!(
            "frame of {len} bytes exceeds the {max_frame_size} byte limit"
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(Some(Bytes::from(payload)))
}

// ---------------------------------------------------------------------------
// TcpTransport
// ---------------------------------------------------------------------------

pub struct TcpTransport {
    advertised: String,
    max_frame_size: usize,
    send_timeout: Duration,
    connections: Mutex<HashMap<String, Arc<Mutex<TcpStream>>>>,
}

impl TcpTransport {
    /// Bind `listen_addr` and start accepting. Inbound frames from every
    /// connection land on the returned queue until `shutdown` flips.
    ///
    /// The advertised address is `advertise` if given, else the bound
    /// socket address (so `127.0.0.1:0` advertises the real port).
    pub async fn bind(
        listen_addr: &str,
        advertise: Option<String>,
        max_frame_size: usize,
        send_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, Inbound), TransportError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| TransportError::Io(format!("bind {listen_addr}: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let advertised = advertise.unwrap_or_else(|| bound.to_string());
        info!(%bound, %advertised, "tcp transport listening");

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        tokio::spawn(accept_loop(listener, tx, max_frame_size, shutdown));

        let transport = Self {
            advertised,
            max_frame_size,
            send_timeout,
            connections: Mutex::new(HashMap::new()),
        };
        Ok((transport, rx))
    }

    async fn connection(&self, addr: &str) -> Result<Arc<Mutex<TcpStream>>, TransportError> {
        if let Some(existing) = self.connections.lock().await.get(addr) {
            return Ok(Arc::clone(existing));
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Unreachable(format!("{addr}: connect timed out")))?
            .map_err(|e| TransportError::Unreachable(format!("{addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        debug!(peer = addr, "opened tcp connection");

        let conn = Arc::new(Mutex::new(stream));
        self.connections
            .lock()
            .await
            .insert(addr.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    async fn drop_connection(&self, addr: &str) {
        self.connections.lock().await.remove(addr);
    }

    async fn write_frame(&self, addr: &str, frame: &[u8]) -> Result<(), TransportError> {
        let conn = self.connection(addr).await?;
        let mut stream = conn.lock().await;
        stream
            .write_all(frame)
            .await
            .map_err(|e| TransportError::Io(format!("{addr}: {e}")))
    }

    pub async fn open_connections(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, addr: &str, bytes: Bytes) -> Result<(), TransportError> {
        let frame = encode_frame(&bytes, self.max_frame_size)?;
        match tokio::time::timeout(self.send_timeout, self.send_frame(addr, &frame)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(peer = addr, timeout = ?self.send_timeout, "tcp send timed out, dropping connection");
                self.drop_connection(addr).await;
                Err(TransportError::Unreachable(format!(
                    "{addr}: send timed out after {:?}",
                    self.send_timeout
                )))
            }
        }
    }

    fn local_addr(&self) -> String {
        self.advertised.clone()
    }
}

impl TcpTransport {
    async fn send_frame(&self, addr: &str, frame: &[u8]) -> Result<(), TransportError> {
        // A cached connection may have been closed by the peer; one retry
        // on a fresh connection.
        match self.write_frame(addr, frame).await {
            Ok(()) => Ok(()),
            Err(TransportError::Io(reason)) => {
                trace!(peer = addr, %reason, "reconnecting");
                self.drop_connection(addr).await;
                let result = self.write_frame(addr, frame).await;
                if result.is_err() {
                    self.drop_connection(addr).await;
                }
                result
            }
            Err(e) => Err(e),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<(String, Bytes)>,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%peer, "accepted tcp connection");
                    tokio::spawn(read_loop(stream, peer.to_string(), tx.clone(), max_frame_size));
                }
                Err(e) => warn!(error = %e, "tcp accept failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("tcp listener stopping");
                    return;
                }
            }
        }
    }
}

async fn read_loop(
    mut stream: TcpStream,
    peer: String,
    tx: mpsc::Sender<(String, Bytes)>,
    max_frame_size: usize,
) {
    loop {
        match read_frame(&mut stream, max_frame_size).await {
            Ok(Some(payload)) => {
                if tx.send((peer.clone(), payload)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(%peer, "tcp connection closed");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "dropping tcp connection");
                return;
            }
        }
    }
}
