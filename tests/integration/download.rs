use crate::*;

use std::time::Duration;

use shoal_core::FileId;
use shoal_services::ingest;
use shoald::transfer::{TransferError, TransferEvent};

/// A downloads from two holders in parallel and lands a byte-identical file.
#[tokio::test]
async fn download_pulls_a_file_from_two_holders() {
    let a = Node::start(test_config(discovery_port(10))).await.unwrap();
    let b = Node::start(test_config(discovery_port(11))).await.unwrap();
    let mut config = test_config(discovery_port(12));
    config.storage.download_dir = scratch_dir("swarm-downloads");
    let c = Node::start(config).await.unwrap();

    // Both holders share identical content under the same filename, so the
    // advert c ends up keeping is the same whichever reply lands first.
    let content = patterned_bytes(1_000_000);
    let path_a = scratch_dir("swarm-src-a").join("payload.bin");
    let path_b = scratch_dir("swarm-src-b").join("payload.bin");
    std::fs::write(&path_a, &content).unwrap();
    std::fs::write(&path_b, &content).unwrap();
    let record = a.share(&path_a).unwrap();
    let shared_b = b.share(&path_b).unwrap();
    assert_eq!(record.file_id, shared_b.file_id, "same bytes, same id");
    assert_eq!(record.chunk_count, 4);

    introduce(&c, &a);
    introduce(&c, &b);
    c.refresh_catalog().await;

    let file_id = record.file_id.clone();
    wait_until(Duration::from_secs(5), || {
        c.holders(&file_id)
            .map(|entries| entries.len() == 4 && entries.iter().all(|e| e.holders.len() == 2))
            .unwrap_or(false)
    })
    .await
    .expect("c never learned both holders for every chunk");

    let mut handle = c.download(&file_id).unwrap();
    let mut progress = Vec::new();
    let mut done_path = None;
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = handle.next_event().await {
            match event {
                TransferEvent::Progress(p) => progress.push(p),
                TransferEvent::Done { path } => {
                    done_path = Some(path);
                    break;
                }
                other => panic!("unexpected terminal event: {other:?}"),
            }
        }
    })
    .await
    .unwrap();

    // One progress event per chunk, percent monotonic and ending at 100.
    assert_eq!(progress.len(), 4);
    for pair in progress.windows(2) {
        assert!(pair[1].percent >= pair[0].percent);
        assert!(pair[1].chunks_received > pair[0].chunks_received);
    }
    let last = progress.last().unwrap();
    assert_eq!(last.percent, 100.0);
    assert_eq!(last.chunks_received, 4);
    assert_eq!(last.chunks_total, 4);
    assert!(last.rate.is_some(), "rate should be measurable by the end");

    let path = done_path.unwrap();
    assert_eq!(path.file_name().unwrap(), "payload.bin");
    assert_eq!(std::fs::read(&path).unwrap(), content);

    // The transfer recorded verified hashes and serving holders.
    let entries = c.catalog().list_chunk_holders(&file_id).unwrap();
    assert!(entries.iter().all(|e| e.hash.is_some()));

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

/// A holder serving bytes that disagree with the recorded chunk hash is
/// dropped for that chunk and the download finishes from the honest one.
#[tokio::test]
async fn corrupt_holder_is_evicted_and_retried_elsewhere() {
    let mut config_a = test_config(discovery_port(13));
    config_a.transfer.chunk_size = 1024;
    let a = Node::start(config_a).await.unwrap();
    let mut config_b = test_config(discovery_port(14));
    config_b.transfer.chunk_size = 1024;
    let b = Node::start(config_b).await.unwrap();
    let mut config_c = test_config(discovery_port(15));
    config_c.transfer.chunk_size = 1024;
    let c = Node::start(config_c).await.unwrap();

    let good = patterned_bytes(4096);
    let dir = scratch_dir("evict-src");
    let path_a = dir.join("data-a.bin");
    let path_b = dir.join("data-b.bin");
    std::fs::write(&path_a, &good).unwrap();
    std::fs::write(&path_b, &good).unwrap();
    let record = a.share(&path_a).unwrap();
    b.share(&path_b).unwrap();
    assert_eq!(record.chunk_count, 4);

    // A's copy rots on disk after sharing. It will serve the rotten bytes
    // with a self-consistent hash; only the recorded hash catches it.
    let rotten: Vec<u8> = good.iter().map(|byte| byte ^ 0xff).collect();
    std::fs::write(&path_a, &rotten).unwrap();

    // Seed c with the correct hashes and both holders, a first. Chunk
    // rotation starts at index % 2, so even chunks try a (corrupt) first.
    let scanned = ingest::scan_file(&path_b, 1024).unwrap();
    let file_id = scanned.record.file_id.clone();
    let catalog = c.catalog();
    catalog.upsert_file(scanned.record.clone()).unwrap();
    for (index, hash) in scanned.chunk_hashes.iter().enumerate() {
        catalog
            .record_chunk_holder(&file_id, index as u32, Some(hash), a.peer_id())
            .unwrap();
        catalog
            .record_chunk_holder(&file_id, index as u32, Some(hash), b.peer_id())
            .unwrap();
    }
    introduce(&c, &a);
    introduce(&c, &b);

    let dest = scratch_dir("evict-dst").join("data.bin");
    let handle = c.download_to(&file_id, dest.clone()).unwrap();
    let path = tokio::time::timeout(Duration::from_secs(30), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(path, dest);
    assert_eq!(std::fs::read(&dest).unwrap(), good);

    // Even chunks dropped a; odd chunks never had a reason to.
    let entries = catalog.list_chunk_holders(&file_id).unwrap();
    for (index, entry) in entries.iter().enumerate() {
        if index % 2 == 0 {
            assert!(
                !entry.holders.iter().any(|h| h.as_str() == a.peer_id()),
                "chunk {index} should have evicted the corrupt holder"
            );
        } else {
            assert!(entry.holders.iter().any(|h| h.as_str() == a.peer_id()));
        }
        assert!(entry.holders.iter().any(|h| h.as_str() == b.peer_id()));
    }

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

/// With every holder corrupt, the download fails instead of writing bad
/// bytes, and nothing lands at the destination.
#[tokio::test]
async fn download_fails_when_every_holder_is_corrupt() {
    let mut config_a = test_config(discovery_port(16));
    config_a.transfer.chunk_size = 1024;
    let a = Node::start(config_a).await.unwrap();
    let mut config_c = test_config(discovery_port(17));
    config_c.transfer.chunk_size = 1024;
    let c = Node::start(config_c).await.unwrap();

    let good = patterned_bytes(2048);
    let dir = scratch_dir("corrupt-src");
    let path_a = dir.join("data.bin");
    std::fs::write(&path_a, &good).unwrap();
    let record = a.share(&path_a).unwrap();
    let rotten: Vec<u8> = good.iter().map(|byte| byte ^ 0xff).collect();
    std::fs::write(&path_a, &rotten).unwrap();

    // Seed c with the hashes of the good content; a is the only holder.
    let reference = dir.join("reference.bin");
    std::fs::write(&reference, &good).unwrap();
    let scanned = ingest::scan_file(&reference, 1024).unwrap();
    let catalog = c.catalog();
    catalog.upsert_file(scanned.record.clone()).unwrap();
    for (index, hash) in scanned.chunk_hashes.iter().enumerate() {
        catalog
            .record_chunk_holder(&record.file_id, index as u32, Some(hash), a.peer_id())
            .unwrap();
    }
    introduce(&c, &a);

    let dest = scratch_dir("corrupt-dst").join("data.bin");
    let handle = c.download_to(&record.file_id, dest.clone()).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(15), handle.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TransferError::Integrity { .. }));
    assert!(!dest.exists(), "failed download must not leave output");

    a.shutdown().await;
    c.shutdown().await;
}

/// Cancelling a download ends it with a `Cancelled` outcome and leaves no
/// partial file behind; the single-flight slot frees up afterwards.
#[tokio::test]
async fn cancel_stops_a_download_cleanly() {
    let c = Node::start(test_config(discovery_port(18))).await.unwrap();

    // One holder that exists only as a catalog row; requests to it can never
    // be delivered, which keeps the download in flight long enough to cancel.
    let catalog = c.catalog();
    catalog
        .upsert_peer(shoal_services::PeerRecord {
            peer_id: "ghost".into(),
            address: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 1,
            last_seen: std::time::SystemTime::now(),
            unreachable: false,
        })
        .unwrap();
    let record = shoal_services::FileRecord {
        file_id: FileId::from_raw("1234abcd5678ef00"),
        filename: "ghostly.bin".into(),
        size: 100,
        content_hash: "00".repeat(32),
        chunk_count: 1,
    };
    catalog.upsert_file(record.clone()).unwrap();
    catalog
        .record_chunk_holder(&record.file_id, 0, None, "ghost")
        .unwrap();

    let dest = scratch_dir("cancel-dst").join("ghostly.bin");
    let first = c.download_to(&record.file_id, dest.clone()).unwrap();

    // A second download of the same file is refused while one is active.
    let second = c.download_to(&record.file_id, dest.clone()).unwrap_err();
    assert!(matches!(second, TransferError::AlreadyActive(_)));

    first.cancel();
    let err = tokio::time::timeout(Duration::from_secs(10), first.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled(_)));
    assert!(!dest.exists(), "cancelled download must not leave output");

    c.shutdown().await;
}

/// Downloading a file id the catalog has never heard of fails immediately.
#[tokio::test]
async fn download_of_unknown_file_is_rejected() {
    let c = Node::start(test_config(discovery_port(19))).await.unwrap();

    let err = c
        .download_to(
            &FileId::from_raw("deadbeef00000000"),
            scratch_dir("unknown-dst").join("never.bin"),
        )
        .unwrap_err();
    assert!(matches!(err, TransferError::NotFound(_)));

    c.shutdown().await;
}

/// An empty file transfers with no chunk traffic at all.
#[tokio::test]
async fn empty_file_downloads_without_chunk_traffic() {
    let a = Node::start(test_config(discovery_port(20))).await.unwrap();
    let mut config = test_config(discovery_port(21));
    config.storage.download_dir = scratch_dir("empty-downloads");
    let c = Node::start(config).await.unwrap();

    let dir = scratch_dir("empty-src");
    let path = dir.join("empty.bin");
    std::fs::write(&path, b"").unwrap();
    let record = a.share(&path).unwrap();
    assert_eq!(record.chunk_count, 0);

    introduce(&c, &a);
    c.refresh_catalog().await;
    wait_until(Duration::from_secs(5), || {
        c.catalog().get_file(&record.file_id).is_some()
    })
    .await
    .expect("c never learned the empty share");

    let handle = c.download(&record.file_id).unwrap();
    let path = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), Vec::<u8>::new());

    a.shutdown().await;
    c.shutdown().await;
}
