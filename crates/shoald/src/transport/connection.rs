//! Per-connection reader and writer tasks.
//!
//! Dialed connections are keyed to their peer immediately and announce this
//! node as their first record. Accepted connections stay anonymous until the
//! first record arrives; its `peer_id` keys them. Either way the reader
//! deregisters the connection when the socket dies, and the writer follows
//! via the per-connection shutdown channel or queue closure.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use shoal_core::protocol::{Envelope, Payload, ProtocolError};

use super::{ConnectionHandle, Inbound, Transport, PROTOCOL_ERROR_LIMIT};

/// Start the task pair for one socket and return its send queue.
pub(crate) fn spawn(
    transport: Transport,
    stream: TcpStream,
    addr: SocketAddr,
    dialed_peer: Option<String>,
) -> mpsc::Sender<Envelope> {
    let conn_id = transport.next_conn_id();
    let (queue_tx, queue_rx) = mpsc::channel(transport.send_queue_depth());
    let (conn_shutdown_tx, conn_shutdown_rx) = broadcast::channel(1);
    let (read_half, write_half) = stream.into_split();

    let mut registered_as = None;
    if let Some(peer_id) = dialed_peer {
        let handle = ConnectionHandle {
            id: conn_id,
            outbound: queue_tx.clone(),
        };
        if transport.register_connection(&peer_id, handle) {
            registered_as = Some(peer_id);
        } else {
            tracing::debug!(peer_id, %addr, "lost a dial race, extra connection unkeyed");
        }
        // First record on an outbound connection introduces us, so the far
        // end can key it and learn our transfer port.
        let announce = Envelope::new(
            transport.local_peer_id(),
            Payload::Announce {
                port: transport.transfer_port(),
            },
        );
        let _ = queue_tx.try_send(announce);
    }

    tokio::spawn(write_loop(write_half, queue_rx, conn_shutdown_rx, addr));
    tokio::spawn(read_loop(
        transport,
        read_half,
        addr,
        conn_id,
        queue_tx.clone(),
        registered_as,
        conn_shutdown_tx,
    ));
    queue_tx
}

async fn read_loop(
    transport: Transport,
    read_half: OwnedReadHalf,
    addr: SocketAddr,
    conn_id: u64,
    outbound: mpsc::Sender<Envelope>,
    mut registered_as: Option<String>,
    conn_shutdown: broadcast::Sender<()>,
) {
    let inbound = transport.inbound_sender();
    let mut lines = BufReader::new(read_half).lines();
    let mut violations: u32 = 0;
    // Held only until the first record; the writer must see the queue close
    // when the table entry goes away.
    let mut keying_queue = Some(outbound);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(%addr, "connection closed by peer");
                break;
            }
            Err(err) => {
                tracing::debug!(%addr, error = %err, "connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match Envelope::decode(&line) {
            Ok(envelope) => {
                let peer_id = envelope.peer_id.clone();
                if let Some(queue) = keying_queue.take() {
                    if registered_as.is_none() && peer_id != transport.local_peer_id() {
                        let handle = ConnectionHandle {
                            id: conn_id,
                            outbound: queue,
                        };
                        if transport.register_connection(&peer_id, handle) {
                            tracing::debug!(peer_id, %addr, "connection keyed");
                            registered_as = Some(peer_id.clone());
                        } else {
                            tracing::debug!(peer_id, %addr, "peer already connected, extra connection unkeyed");
                        }
                    }
                }

                let is_goodbye = matches!(envelope.payload, Payload::Goodbye {});
                let message = Inbound {
                    peer_id,
                    addr,
                    payload: envelope.payload,
                };
                if inbound.send(message).await.is_err() {
                    tracing::debug!(%addr, "router gone, closing connection");
                    break;
                }
                if is_goodbye {
                    break;
                }
            }
            Err(ProtocolError::UnknownType(kind)) => {
                tracing::debug!(%addr, kind, "unknown message type ignored");
            }
            Err(err) => {
                violations += 1;
                tracing::warn!(%addr, error = %err, violations, "malformed record dropped");
                if violations >= PROTOCOL_ERROR_LIMIT {
                    tracing::warn!(%addr, "closing connection after repeated protocol violations");
                    break;
                }
            }
        }
    }

    let _ = conn_shutdown.send(());
    if let Some(peer_id) = registered_as {
        transport.deregister_connection(&peer_id, conn_id);
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Envelope>,
    mut conn_shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) {
    loop {
        tokio::select! {
            _ = conn_shutdown.recv() => break,
            maybe = queue.recv() => {
                let Some(envelope) = maybe else { break };
                let mut bytes = match envelope.encode() {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(%addr, error = %err, "dropping unencodable record");
                        continue;
                    }
                };
                bytes.push(b'\n');
                if let Err(err) = write_half.write_all(&bytes).await {
                    tracing::debug!(%addr, error = %err, "connection write failed");
                    break;
                }
            }
        }
    }
}
