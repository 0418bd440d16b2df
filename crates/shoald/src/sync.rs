//! Periodic catalog exchange.
//!
//! Every interval, ask each online peer for its share list. The replies come
//! back through the router, which merges them into the catalog, so over time
//! every node converges on the same view of who shares what.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use shoal_core::Payload;
use shoal_services::PeerDirectory;

use crate::transport::Transport;

pub struct CatalogSync {
    directory: PeerDirectory,
    transport: Transport,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl CatalogSync {
    pub fn new(
        directory: PeerDirectory,
        transport: Transport,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            directory,
            transport,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("catalog sync shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    request_file_lists(&self.directory, &self.transport).await;
                }
            }
        }
    }
}

/// Send a file list request to every peer the directory considers online.
/// Failures are per-peer and non-fatal; the next round tries again.
pub async fn request_file_lists(directory: &PeerDirectory, transport: &Transport) {
    let peers = directory.list_online();
    if peers.is_empty() {
        return;
    }
    tracing::debug!(peers = peers.len(), "requesting file lists");
    for peer in peers {
        if let Err(err) = transport
            .send(&peer.peer_id, Payload::FileListRequest {})
            .await
        {
            tracing::debug!(peer_id = %peer.peer_id, error = %err, "file list request failed");
        }
    }
}
