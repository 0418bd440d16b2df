use crate::*;

use std::time::Duration;

use tokio::net::UdpSocket;

/// A raw beacon datagram sent straight at the discovery port registers the
/// sender under its claimed transfer port, addressed by the datagram source.
#[tokio::test]
async fn beacon_registers_the_sender() {
    let port = discovery_port(45);
    let a = Node::start(test_config(port)).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let beacon = r#"{"type":"ANNOUNCE","peer_id":"beacon-peer","port":4567}"#;
    socket
        .send_to(beacon.as_bytes(), ("127.0.0.1", port))
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        a.peers()
            .iter()
            .any(|p| p.peer_id == "beacon-peer" && p.port == 4567)
    })
    .await
    .expect("beacon never registered");

    a.shutdown().await;
}

/// Beacons carrying this node's own id never create a peer row.
#[tokio::test]
async fn own_beacons_are_ignored() {
    let port = discovery_port(46);
    let a = Node::start(test_config(port)).await.unwrap();

    // Replay a's identity from an outside socket, then a legitimate foreign
    // beacon as the control.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let own = format!(
        r#"{{"type":"ANNOUNCE","peer_id":"{}","port":12345}}"#,
        a.peer_id()
    );
    socket
        .send_to(own.as_bytes(), ("127.0.0.1", port))
        .await
        .unwrap();
    let control = r#"{"type":"ANNOUNCE","peer_id":"control-peer","port":2222}"#;
    socket
        .send_to(control.as_bytes(), ("127.0.0.1", port))
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        a.peers().iter().any(|p| p.peer_id == "control-peer")
    })
    .await
    .expect("control beacon never registered");
    assert!(a.peers().iter().all(|p| p.peer_id != a.peer_id()));

    a.shutdown().await;
}

/// Garbage datagrams are dropped without wedging the listener.
#[tokio::test]
async fn garbage_datagrams_are_ignored() {
    let port = discovery_port(47);
    let a = Node::start(test_config(port)).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagrams: [&[u8]; 4] = [
        &[0xff, 0xfe, 0x00, 0x01],
        b"not json",
        br#"{"type":"ANNOUNCE"}"#,
        br#"{"type":"ANNOUNCE","peer_id":"survivor","port":3333}"#,
    ];
    for datagram in datagrams {
        socket
            .send_to(datagram, ("127.0.0.1", port))
            .await
            .unwrap();
    }

    wait_until(Duration::from_secs(5), || {
        a.peers().iter().any(|p| p.peer_id == "survivor")
    })
    .await
    .expect("listener should survive garbage datagrams");
    assert_eq!(a.peers().len(), 1);

    a.shutdown().await;
}

/// Full broadcast discovery between two real nodes on one segment.
/// Broadcast delivery depends on the host network; skips when nothing
/// arrives rather than failing.
#[tokio::test]
async fn nodes_discover_each_other_over_broadcast() {
    let port = discovery_port(48);
    let mut config_a = test_config(port);
    config_a.network.broadcast_interval_secs = 1;
    let mut config_b = test_config(port);
    config_b.network.broadcast_interval_secs = 1;
    let a = Node::start(config_a).await.unwrap();
    let b = Node::start(config_b).await.unwrap();

    let found = wait_until(Duration::from_secs(8), || {
        a.peers().iter().any(|p| p.peer_id == b.peer_id())
            && b.peers().iter().any(|p| p.peer_id == a.peer_id())
    })
    .await;

    if found.is_err() {
        eprintln!("SKIP: UDP broadcast not deliverable in this environment");
        a.shutdown().await;
        b.shutdown().await;
        return;
    }

    let row = a
        .peers()
        .into_iter()
        .find(|p| p.peer_id == b.peer_id())
        .unwrap();
    assert_eq!(row.port, b.transfer_port());

    a.shutdown().await;
    b.shutdown().await;
}
