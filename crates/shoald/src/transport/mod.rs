//! Transport layer: one persistent TCP connection per peer, carrying
//! newline-delimited JSON records.
//!
//! Connections are symmetric. Whoever needs to talk dials first; after that
//! the same connection carries records both ways, and the first record to
//! arrive on an accepted socket tells us who is on the other end. Each live
//! connection runs a writer task draining a bounded queue (send order is
//! preserved per peer) and a reader task feeding the router. The table here
//! maps peer id to the write side.
//!
//! [`Transport::send`] is the only way records leave this node: it finds or
//! dials the connection, retries with backoff, and flags the peer
//! unreachable when every attempt fails.

pub mod connection;
pub mod listener;

pub use listener::TransportListener;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use shoal_core::protocol::{Envelope, Payload};
use shoal_services::PeerDirectory;

/// Outbound queue depth per connection. A full queue exerts backpressure on
/// the sender rather than dropping records.
const SEND_QUEUE_DEPTH: usize = 64;
/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Cap on how long a dial may hang before counting as a failed attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Malformed records tolerated before a connection is closed.
pub(crate) const PROTOCOL_ERROR_LIMIT: u32 = 5;

/// A decoded record handed to the router, with where it came from.
#[derive(Debug)]
pub struct Inbound {
    pub peer_id: String,
    pub addr: SocketAddr,
    pub payload: Payload,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("peer {0} is not in the directory")]
    UnknownPeer(String),
    #[error("peer {peer_id} unreachable after {attempts} attempts")]
    Unreachable { peer_id: String, attempts: u32 },
}

enum DialError {
    UnknownPeer,
    Failed,
}

/// Write side of one live connection.
pub(crate) struct ConnectionHandle {
    pub(crate) id: u64,
    pub(crate) outbound: mpsc::Sender<Envelope>,
}

struct TransportInner {
    local_peer_id: String,
    transfer_port: u16,
    directory: PeerDirectory,
    connections: DashMap<String, ConnectionHandle>,
    inbound_tx: mpsc::Sender<Inbound>,
    next_conn_id: AtomicU64,
    send_retries: u32,
}

/// Shared transport state and the send path. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(
        local_peer_id: String,
        transfer_port: u16,
        directory: PeerDirectory,
        inbound_tx: mpsc::Sender<Inbound>,
        send_retries: u32,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                local_peer_id,
                transfer_port,
                directory,
                connections: DashMap::new(),
                inbound_tx,
                next_conn_id: AtomicU64::new(1),
                send_retries,
            }),
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    /// The TCP port announced to peers.
    pub fn transfer_port(&self) -> u16 {
        self.inner.transfer_port
    }

    /// Send one record to a peer, dialing a connection if none is live.
    ///
    /// Failed attempts retry with exponential backoff. Exhausting the
    /// attempts flags the peer unreachable in the directory; the peer's next
    /// message clears the flag.
    pub async fn send(&self, peer_id: &str, payload: Payload) -> Result<(), SendError> {
        let envelope = Envelope::new(self.inner.local_peer_id.clone(), payload);
        let attempts = self.inner.send_retries.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            match self.queue_for(peer_id).await {
                Ok(queue) => {
                    if queue.send(envelope.clone()).await.is_ok() {
                        return Ok(());
                    }
                    // Writer exited between lookup and send; next attempt
                    // redials.
                    tracing::debug!(peer_id, attempt, "connection went away mid-send");
                }
                Err(DialError::UnknownPeer) => {
                    return Err(SendError::UnknownPeer(peer_id.to_string()));
                }
                Err(DialError::Failed) => {}
            }
        }

        self.inner.directory.mark_unreachable(peer_id);
        Err(SendError::Unreachable {
            peer_id: peer_id.to_string(),
            attempts,
        })
    }

    /// Drop the connection to a peer, if any. The writer task exits once the
    /// queue drains; the reader follows on socket close.
    pub fn disconnect(&self, peer_id: &str) {
        if self.inner.connections.remove(peer_id).is_some() {
            tracing::debug!(peer_id, "connection dropped");
        }
    }

    /// Queue a GOODBYE on every live connection. Best effort: a peer with a
    /// saturated queue misses it and times us out instead.
    pub fn broadcast_goodbye(&self) {
        let goodbye = Envelope::new(self.inner.local_peer_id.clone(), Payload::Goodbye {});
        for entry in self.inner.connections.iter() {
            if entry.value().outbound.try_send(goodbye.clone()).is_ok() {
                tracing::debug!(peer_id = %entry.key(), "goodbye queued");
            }
        }
    }

    /// Existing queue for the peer, or dial and spawn a fresh connection.
    async fn queue_for(&self, peer_id: &str) -> Result<mpsc::Sender<Envelope>, DialError> {
        if let Some(handle) = self.inner.connections.get(peer_id) {
            return Ok(handle.outbound.clone());
        }
        let Some(peer) = self.inner.directory.lookup(peer_id) else {
            return Err(DialError::UnknownPeer);
        };

        let addr = SocketAddr::new(peer.address, peer.port);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::debug!(peer_id, %addr, error = %err, "connect failed");
                return Err(DialError::Failed);
            }
            Err(_) => {
                tracing::debug!(peer_id, %addr, "connect timed out");
                return Err(DialError::Failed);
            }
        };
        tracing::debug!(peer_id, %addr, "connected");
        Ok(connection::spawn(
            self.clone(),
            stream,
            addr,
            Some(peer_id.to_string()),
        ))
    }

    // ── Hooks for connection tasks ──────────────────────────────────────────

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn send_queue_depth(&self) -> usize {
        SEND_QUEUE_DEPTH
    }

    pub(crate) fn inbound_sender(&self) -> mpsc::Sender<Inbound> {
        self.inner.inbound_tx.clone()
    }

    /// Key a connection by the peer on its far end. Refused when the peer
    /// already has a live connection (the first one stays canonical).
    pub(crate) fn register_connection(&self, peer_id: &str, handle: ConnectionHandle) -> bool {
        match self.inner.connections.entry(peer_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Remove a connection's table entry, but only if the entry still refers
    /// to this connection and not a replacement.
    pub(crate) fn deregister_connection(&self, peer_id: &str, conn_id: u64) {
        self.inner
            .connections
            .remove_if(peer_id, |_, handle| handle.id == conn_id);
    }
}
