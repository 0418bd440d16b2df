//! Message router: drains the transport's inbound queue and dispatches every
//! record by type.
//!
//! The match below is exhaustive over [`Payload`], so adding a record type
//! will not compile until this router handles it. Any received record also
//! counts as a liveness signal for its sender.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

use shoal_core::protocol::{FileAdvert, Payload};
use shoal_core::FileId;
use shoal_services::{CatalogStore, FileRecord, Ingester, PeerDirectory};

use crate::transfer::{ChunkReply, PendingChunks};
use crate::transport::{Inbound, Transport};

pub struct Router {
    directory: PeerDirectory,
    catalog: Arc<dyn CatalogStore>,
    ingester: Ingester,
    transport: Transport,
    pending: PendingChunks,
    inbound_rx: mpsc::Receiver<Inbound>,
    shutdown: broadcast::Receiver<()>,
}

impl Router {
    pub fn new(
        directory: PeerDirectory,
        catalog: Arc<dyn CatalogStore>,
        ingester: Ingester,
        transport: Transport,
        pending: PendingChunks,
        inbound_rx: mpsc::Receiver<Inbound>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            directory,
            catalog,
            ingester,
            transport,
            pending,
            inbound_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("router shutting down");
                    return Ok(());
                }
                message = self.inbound_rx.recv() => {
                    let Some(inbound) = message else {
                        tracing::info!("inbound channel closed, router exiting");
                        return Ok(());
                    };
                    self.dispatch(inbound).await;
                }
            }
        }
    }

    async fn dispatch(&self, inbound: Inbound) {
        let Inbound {
            peer_id,
            addr,
            payload,
        } = inbound;
        // Any record proves the sender is alive right now.
        self.directory.refresh(&peer_id);

        match payload {
            Payload::Announce { port } => {
                self.directory.upsert(&peer_id, addr.ip(), port);
            }
            Payload::FileListRequest {} => {
                self.send_file_list(&peer_id).await;
            }
            Payload::FileListResponse { files } => {
                self.merge_adverts(&peer_id, files);
            }
            Payload::ChunkRequest {
                file_id,
                chunk_index,
            } => {
                self.serve_chunk(&peer_id, file_id, chunk_index).await;
            }
            Payload::ChunkData {
                file_id,
                chunk_index,
                data,
                hash,
            } => {
                let reply = ChunkReply::Data {
                    bytes: data,
                    hash,
                    holder: peer_id,
                };
                if !self.pending.complete(&file_id, chunk_index, reply) {
                    tracing::debug!(%file_id, chunk_index, "unsolicited chunk data dropped");
                }
            }
            Payload::ChunkNotFound {
                file_id,
                chunk_index,
            } => {
                let reply = ChunkReply::NotFound { holder: peer_id };
                if !self.pending.complete(&file_id, chunk_index, reply) {
                    tracing::debug!(%file_id, chunk_index, "stray chunk refusal dropped");
                }
            }
            Payload::Goodbye {} => {
                self.directory.mark_departed(&peer_id);
                self.transport.disconnect(&peer_id);
            }
        }
    }

    /// Answer FILE_LIST_REQUEST with the files this node itself shares.
    /// Third-party knowledge stays out; peers ask its holders directly.
    async fn send_file_list(&self, peer_id: &str) {
        let mut files = Vec::new();
        for (file_id, _path) in self.catalog.list_local_shares() {
            if let Some(record) = self.catalog.get_file(&file_id) {
                files.push(FileAdvert {
                    file_id: record.file_id,
                    filename: record.filename,
                    size: record.size,
                    hash: record.content_hash,
                    chunks_total: record.chunk_count,
                });
            }
        }
        tracing::debug!(peer_id, count = files.len(), "sending file list");
        if let Err(err) = self
            .transport
            .send(peer_id, Payload::FileListResponse { files })
            .await
        {
            tracing::warn!(peer_id, error = %err, "file list reply failed");
        }
    }

    /// Fold a peer's advertised files into the catalog: upsert each record
    /// and list the sender as holder of every chunk it advertises.
    fn merge_adverts(&self, peer_id: &str, files: Vec<FileAdvert>) {
        for advert in files {
            let FileAdvert {
                file_id,
                filename,
                size,
                hash,
                chunks_total,
            } = advert;
            let record = FileRecord {
                file_id: file_id.clone(),
                filename,
                size,
                content_hash: hash,
                chunk_count: chunks_total,
            };
            if let Err(err) = self.catalog.upsert_file(record) {
                tracing::warn!(peer_id, %file_id, error = %err, "file record rejected");
                continue;
            }
            for index in 0..chunks_total {
                // A bare claim: no hash until a chunk is actually verified.
                if let Err(err) = self
                    .catalog
                    .record_chunk_holder(&file_id, index, None, peer_id)
                {
                    tracing::warn!(peer_id, %file_id, index, error = %err, "holder claim rejected");
                    break;
                }
            }
        }
    }

    async fn serve_chunk(&self, peer_id: &str, file_id: FileId, chunk_index: u32) {
        let reply = match self.ingester.read_chunk(&file_id, chunk_index) {
            Ok(Some(chunk)) => {
                tracing::debug!(
                    peer_id,
                    %file_id,
                    chunk_index,
                    bytes = chunk.data.len(),
                    "serving chunk"
                );
                Payload::ChunkData {
                    file_id,
                    chunk_index,
                    data: chunk.data,
                    hash: chunk.hash,
                }
            }
            Ok(None) => {
                tracing::debug!(peer_id, %file_id, chunk_index, "chunk not held");
                Payload::ChunkNotFound {
                    file_id,
                    chunk_index,
                }
            }
            Err(err) => {
                tracing::warn!(peer_id, %file_id, chunk_index, error = %err, "chunk read failed");
                Payload::ChunkNotFound {
                    file_id,
                    chunk_index,
                }
            }
        };
        if let Err(err) = self.transport.send(peer_id, reply).await {
            tracing::warn!(peer_id, error = %err, "chunk reply failed");
        }
    }
}
