//! Shoal integration test harness.
//!
//! These tests bring up real nodes inside the test process, all on loopback.
//! Every node binds an OS-assigned transfer port, and tests introduce peers
//! to each other through the catalog instead of waiting for UDP broadcast,
//! which CI networks often filter. The periodic loops (beacons, sync) are
//! configured so slow that tests drive every exchange explicitly; the
//! discovery tests that need real broadcast delivery skip themselves when
//! the environment cannot provide it.
//!
//! Each test uses its own discovery port offset and its own scratch
//! directory, so the whole suite can run in parallel.

mod discovery;
mod download;
mod sync;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};

use shoal_core::config::ShoalConfig;
use shoal_services::PeerRecord;
use shoald::Node;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Base for per-test discovery ports. Offsets are assigned once per test
/// across all test files so beacons never cross between tests.
pub const DISCOVERY_PORT_BASE: u16 = 41000;

pub fn discovery_port(offset: u16) -> u16 {
    DISCOVERY_PORT_BASE + offset
}

/// Config for an embedded test node: fresh random identity, OS-assigned
/// transfer port, periodic loops parked for an hour.
pub fn test_config(discovery_port: u16) -> ShoalConfig {
    let mut config = ShoalConfig::default();
    config.identity.peer_id = String::new();
    config.network.discovery_port = discovery_port;
    config.network.transfer_port = 0;
    config.network.broadcast_interval_secs = 3600;
    config.network.sync_interval_secs = 3600;
    config.transfer.request_timeout_secs = 2;
    config.transfer.send_retries = 2;
    config.storage.download_dir = scratch_dir("default-downloads");
    config
}

/// Make `a` aware of `b` as a live peer on loopback, as a received beacon
/// would have.
pub fn introduce(a: &Node, b: &Node) {
    a.catalog()
        .upsert_peer(PeerRecord {
            peer_id: b.peer_id().to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: b.transfer_port(),
            last_seen: SystemTime::now(),
            unreachable: false,
        })
        .unwrap();
}

/// Poll `predicate` every 25ms until it holds, failing once `limit` elapses.
pub async fn wait_until(limit: Duration, mut predicate: impl FnMut() -> bool) -> Result<()> {
    let start = tokio::time::Instant::now();
    while start.elapsed() < limit {
        if predicate() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    if predicate() {
        return Ok(());
    }
    bail!("condition not met within {limit:?}")
}

/// Scratch directory for one test, unique per process so parallel runs of
/// the suite do not collide.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("shoal-it-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Deterministic content of exactly `len` bytes that does not repeat at
/// chunk boundaries.
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn node_starts_and_stops() {
    let node = Node::start(test_config(discovery_port(0))).await.unwrap();

    assert!(node.transfer_port() > 0, "listener should have a real port");
    assert!(
        node.peer_id().starts_with("shoal-"),
        "empty configured id should generate one: {}",
        node.peer_id()
    );
    assert!(node.peers().is_empty());
    assert!(node.files().is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn share_appears_in_local_listings() {
    let node = Node::start(test_config(discovery_port(1))).await.unwrap();

    let dir = scratch_dir("share-listing");
    let path = dir.join("notes.txt");
    std::fs::write(&path, b"some shared text").unwrap();

    let record = node.share(&path).unwrap();
    assert_eq!(record.filename, "notes.txt");
    assert_eq!(record.size, 16);
    assert_eq!(record.chunk_count, 1);

    let shared = node.shared_files();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].file_id, record.file_id);

    assert!(node.unshare(&record.file_id));
    assert!(node.shared_files().is_empty());
    // The catalog still remembers the file itself.
    assert_eq!(node.files().len(), 1);

    node.shutdown().await;
}
