//! Discovery beacon listener and peer-row purge.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use shoal_core::protocol::Beacon;
use shoal_services::PeerDirectory;

use super::DiscoveryError;

/// Receive beacons on the discovery port and upsert their senders into the
/// directory. The sender's address comes from the datagram; the beacon only
/// claims identity and transfer port.
pub async fn listener_loop(
    directory: PeerDirectory,
    discovery_port: u16,
) -> Result<(), DiscoveryError> {
    let socket = make_listener_socket(discovery_port).map_err(|source| DiscoveryError::Bind {
        port: discovery_port,
        source,
    })?;
    let socket = UdpSocket::from_std(socket)?;
    tracing::info!(port = discovery_port, "discovery listener starting");

    let mut buf = vec![0u8; 2048];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(error = %err, "discovery recv failed");
                continue;
            }
        };
        let text = match std::str::from_utf8(&buf[..len]) {
            Ok(text) => text,
            Err(_) => {
                tracing::trace!(%src, "non-utf8 datagram ignored");
                continue;
            }
        };
        match Beacon::decode(text) {
            Ok(Beacon::Announce { peer_id, port }) => {
                if peer_id == directory.local_peer_id() {
                    tracing::trace!("ignoring own beacon");
                    continue;
                }
                tracing::debug!(peer_id, addr = %src, port, "peer announced");
                directory.upsert(&peer_id, src.ip(), port);
            }
            Err(err) => {
                tracing::trace!(%src, error = %err, "undecodable beacon ignored");
            }
        }
    }
}

/// Periodically drop peer rows that have been silent far past the liveness
/// timeout. Listing already filters stale rows lazily; this keeps the table
/// from growing without bound.
pub async fn purge_loop(directory: PeerDirectory, check_interval: Duration) {
    let mut ticker = tokio::time::interval(check_interval);
    loop {
        ticker.tick().await;
        let removed = directory.purge_stale();
        if removed > 0 {
            tracing::debug!(removed, "purged stale peer rows");
        }
    }
}

fn make_listener_socket(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Several nodes on one host (tests, mostly) share the port.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(socket.into())
}
