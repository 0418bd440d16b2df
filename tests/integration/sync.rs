use crate::*;

use std::time::Duration;

/// Two nodes sharing identical content merge into one catalog record with
/// both holders listed exactly once per chunk.
#[tokio::test]
async fn share_lists_merge_without_duplicates() {
    let a = Node::start(test_config(discovery_port(30))).await.unwrap();
    let b = Node::start(test_config(discovery_port(31))).await.unwrap();
    let c = Node::start(test_config(discovery_port(32))).await.unwrap();

    // 300k is two chunks at the default chunk size.
    let content = patterned_bytes(300_000);
    let path_a = scratch_dir("merge-src-a").join("shared.bin");
    let path_c = scratch_dir("merge-src-c").join("shared.bin");
    std::fs::write(&path_a, &content).unwrap();
    std::fs::write(&path_c, &content).unwrap();
    let record = a.share(&path_a).unwrap();
    let shared_c = c.share(&path_c).unwrap();
    assert_eq!(record.file_id, shared_c.file_id);

    introduce(&b, &a);
    introduce(&b, &c);
    b.refresh_catalog().await;

    let file_id = record.file_id.clone();
    wait_until(Duration::from_secs(5), || {
        b.holders(&file_id)
            .map(|entries| entries.len() == 2 && entries.iter().all(|e| e.holders.len() == 2))
            .unwrap_or(false)
    })
    .await
    .expect("holders never merged");

    // A second round must not duplicate anything.
    b.refresh_catalog().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(b.files().len(), 1, "identical content is one record");
    for entry in b.holders(&file_id).unwrap() {
        assert!(entry.holders.iter().any(|h| h.as_str() == a.peer_id()));
        assert!(entry.holders.iter().any(|h| h.as_str() == c.peer_id()));
        assert_eq!(entry.holders.len(), 2, "no duplicate holders");
    }

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

/// The periodic sync loop picks up remote shares without an explicit
/// refresh call.
#[tokio::test]
async fn periodic_sync_learns_remote_shares() {
    let a = Node::start(test_config(discovery_port(33))).await.unwrap();
    let mut config = test_config(discovery_port(34));
    config.network.sync_interval_secs = 1;
    let b = Node::start(config).await.unwrap();

    let path = scratch_dir("periodic-src").join("late.bin");
    std::fs::write(&path, b"appears after startup").unwrap();
    let record = a.share(&path).unwrap();

    introduce(&b, &a);
    wait_until(Duration::from_secs(10), || {
        b.catalog().get_file(&record.file_id).is_some()
    })
    .await
    .expect("periodic sync never fetched the share list");

    a.shutdown().await;
    b.shutdown().await;
}

/// Exhausted send retries flag the peer unreachable but keep its row.
#[tokio::test]
async fn failed_sends_flag_the_peer_unreachable() {
    let b = Node::start(test_config(discovery_port(35))).await.unwrap();

    b.catalog()
        .upsert_peer(PeerRecord {
            peer_id: "gone".into(),
            address: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 1,
            last_seen: std::time::SystemTime::now(),
            unreachable: false,
        })
        .unwrap();

    // The file list request burns its retries against a dead port.
    b.refresh_catalog().await;

    let row = b.catalog().get_peer("gone").unwrap();
    assert!(row.unreachable, "exhausted retries should set the flag");
    // Flagged, not forgotten: the row still lists while fresh.
    assert!(b.peers().iter().any(|p| p.peer_id == "gone"));

    b.shutdown().await;
}

/// A peer that says goodbye disappears from listings immediately, well
/// before any liveness timeout.
#[tokio::test]
async fn goodbye_departs_immediately() {
    let a = Node::start(test_config(discovery_port(36))).await.unwrap();
    let b = Node::start(test_config(discovery_port(37))).await.unwrap();

    // A message from b gives a a live row for b.
    introduce(&b, &a);
    b.refresh_catalog().await;
    wait_until(Duration::from_secs(5), || {
        a.peers().iter().any(|p| p.peer_id == b.peer_id())
    })
    .await
    .expect("a never learned about b");

    let b_id = b.peer_id().to_string();
    b.shutdown().await;

    wait_until(Duration::from_secs(5), || {
        a.peers().iter().all(|p| p.peer_id != b_id)
    })
    .await
    .expect("goodbye should remove b right away");

    a.shutdown().await;
}
