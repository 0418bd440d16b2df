//! Discovery beacon broadcaster.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use shoal_core::protocol::Beacon;

use super::DiscoveryError;

/// Announce `{peer_id, transfer_port}` to the segment's broadcast address
/// every `interval`. Runs until the task is dropped.
pub async fn broadcast_loop(
    local_peer_id: String,
    transfer_port: u16,
    discovery_port: u16,
    interval: Duration,
) -> Result<(), DiscoveryError> {
    let socket = make_broadcast_socket()?;
    let socket = UdpSocket::from_std(socket)?;
    let dest = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, discovery_port));

    tracing::info!(
        port = discovery_port,
        interval_secs = interval.as_secs(),
        "discovery broadcast starting"
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let beacon = Beacon::Announce {
            peer_id: local_peer_id.clone(),
            port: transfer_port,
        };
        let bytes = match beacon.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "beacon encode failed");
                continue;
            }
        };
        match socket.send_to(&bytes, dest).await {
            Ok(sent) => tracing::trace!(bytes = sent, "beacon sent"),
            Err(err) => tracing::warn!(error = %err, "beacon send failed"),
        }
    }
}

fn make_broadcast_socket() -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    Ok(socket.into())
}
