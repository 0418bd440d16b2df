//! Node assembly.
//!
//! Wires the catalog, discovery, transport, router, sync and transfer engine
//! together, owns their tasks, and exposes the operations a front end (the
//! daemon binary, or a test harness) drives: share, download, list peers and
//! files, shut down.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use shoal_core::config::ShoalConfig;
use shoal_core::FileId;
use shoal_services::{
    CatalogStore, ChunkHolderEntry, FileRecord, Ingester, IngestError, MemoryCatalog,
    PeerDirectory, PeerRecord, StorageError,
};

use crate::discovery;
use crate::router::Router;
use crate::sync::{self, CatalogSync};
use crate::transfer::{DownloadHandle, PendingChunks, TransferEngine, TransferError};
use crate::transport::{Transport, TransportListener};

const INBOUND_QUEUE_DEPTH: usize = 256;
/// How long a goodbye gets to reach connected peers before teardown.
const GOODBYE_FLUSH: Duration = Duration::from_millis(50);

pub struct Node {
    peer_id: String,
    transfer_port: u16,
    catalog: Arc<dyn CatalogStore>,
    directory: PeerDirectory,
    ingester: Ingester,
    transport: Transport,
    engine: TransferEngine,
    download_dir: PathBuf,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bring up a node from `config`: bind the transfer listener, start
    /// discovery, routing and periodic sync, and return the running node.
    pub async fn start(config: ShoalConfig) -> Result<Self> {
        if config.transfer.chunk_size == 0 {
            bail!("transfer.chunk_size must be at least 1");
        }

        let peer_id = if config.identity.peer_id.is_empty() {
            let id = format!("shoal-{}", hex::encode(rand::random::<[u8; 4]>()));
            tracing::info!(peer_id = id, "generated peer id");
            id
        } else {
            config.identity.peer_id.clone()
        };

        // Bind before anything announces the port, so an OS-assigned port
        // (transfer_port = 0 in config) is known from the start.
        let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.network.transfer_port));
        let tcp = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind transfer listener on {listen_addr}"))?;
        let transfer_port = tcp.local_addr()?.port();

        let catalog: Arc<dyn CatalogStore> = MemoryCatalog::shared();
        let directory = PeerDirectory::new(
            catalog.clone(),
            peer_id.clone(),
            config.network.liveness_timeout(),
        );
        let ingester = Ingester::new(catalog.clone(), peer_id.clone(), config.transfer.chunk_size);

        let (shutdown_tx, _) = broadcast::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        let transport = Transport::new(
            peer_id.clone(),
            transfer_port,
            directory.clone(),
            inbound_tx,
            config.transfer.send_retries,
        );
        let pending = PendingChunks::new();
        let engine = TransferEngine::new(
            catalog.clone(),
            transport.clone(),
            pending.clone(),
            peer_id.clone(),
            config.transfer.max_parallel_downloads,
            config.transfer.request_timeout(),
        );

        let mut tasks = Vec::new();

        let acceptor = TransportListener::new(tcp, transport.clone(), shutdown_tx.subscribe());
        tasks.push(tokio::spawn(async move {
            if let Err(err) = acceptor.run().await {
                tracing::error!(error = %err, "transfer listener failed");
            }
        }));

        let router = Router::new(
            directory.clone(),
            catalog.clone(),
            ingester.clone(),
            transport.clone(),
            pending,
            inbound_rx,
            shutdown_tx.subscribe(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(err) = router.run().await {
                tracing::error!(error = %err, "router failed");
            }
        }));

        // Discovery loops run until aborted at shutdown. A listener bind
        // failure degrades the node to manual peering instead of killing it;
        // peers can still be learned from inbound TCP announces.
        let beacon_rx =
            discovery::listener::listener_loop(directory.clone(), config.network.discovery_port);
        tasks.push(tokio::spawn(async move {
            if let Err(err) = beacon_rx.await {
                tracing::error!(error = %err, "discovery listener failed; running without discovery");
            }
        }));

        let beacon_tx = discovery::broadcast::broadcast_loop(
            peer_id.clone(),
            transfer_port,
            config.network.discovery_port,
            config.network.broadcast_interval(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(err) = beacon_tx.await {
                tracing::error!(error = %err, "discovery broadcast failed");
            }
        }));

        tasks.push(tokio::spawn(discovery::listener::purge_loop(
            directory.clone(),
            config.network.liveness_timeout(),
        )));

        let syncer = CatalogSync::new(
            directory.clone(),
            transport.clone(),
            config.network.sync_interval(),
            shutdown_tx.subscribe(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(err) = syncer.run().await {
                tracing::error!(error = %err, "catalog sync failed");
            }
        }));

        tracing::info!(peer_id, transfer_port, "node up");

        Ok(Self {
            peer_id,
            transfer_port,
            catalog,
            directory,
            ingester,
            transport,
            engine,
            download_dir: config.storage.download_dir.clone(),
            shutdown: shutdown_tx,
            tasks,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Port the transfer listener actually bound, which differs from the
    /// configured one when that was 0.
    pub fn transfer_port(&self) -> u16 {
        self.transfer_port
    }

    /// Catalog handle, mostly for tools and tests that seed or inspect state.
    pub fn catalog(&self) -> Arc<dyn CatalogStore> {
        self.catalog.clone()
    }

    /// Share a local file: chunk it, hash it, record this node as holder of
    /// every chunk. Peers pick it up on their next catalog sync.
    pub fn share(&self, path: &Path) -> Result<FileRecord, IngestError> {
        self.ingester.ingest(path)
    }

    /// Stop sharing a file. Returns false if it was not shared.
    pub fn unshare(&self, file_id: &FileId) -> bool {
        self.ingester.unshare(file_id)
    }

    /// Start downloading `file_id` into the configured download directory,
    /// named after the advertised filename.
    pub fn download(&self, file_id: &FileId) -> Result<DownloadHandle, TransferError> {
        let record = self
            .catalog
            .get_file(file_id)
            .ok_or_else(|| TransferError::NotFound(file_id.clone()))?;
        let dest = self.download_dir.join(&record.filename);
        self.engine.start(file_id.clone(), dest)
    }

    /// Start downloading `file_id` to an explicit destination path.
    pub fn download_to(
        &self,
        file_id: &FileId,
        dest: PathBuf,
    ) -> Result<DownloadHandle, TransferError> {
        self.engine.start(file_id.clone(), dest)
    }

    /// Peers currently considered online.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.directory.list_online()
    }

    /// Every file the catalog knows about, local shares and remote adverts.
    pub fn files(&self) -> Vec<FileRecord> {
        self.catalog.list_all_files()
    }

    /// Files this node itself shares.
    pub fn shared_files(&self) -> Vec<FileRecord> {
        self.catalog
            .list_local_shares()
            .into_iter()
            .filter_map(|(file_id, _)| self.catalog.get_file(&file_id))
            .collect()
    }

    /// Per-chunk holder view for a file.
    pub fn holders(&self, file_id: &FileId) -> Result<Vec<ChunkHolderEntry>, StorageError> {
        self.catalog.list_chunk_holders(file_id)
    }

    /// Ask every online peer for its share list now instead of waiting for
    /// the next sync tick.
    pub async fn refresh_catalog(&self) {
        sync::request_file_lists(&self.directory, &self.transport).await;
    }

    /// Announce departure to connected peers, then stop every task.
    pub async fn shutdown(self) {
        tracing::info!(peer_id = self.peer_id, "node shutting down");
        self.transport.broadcast_goodbye();
        tokio::time::sleep(GOODBYE_FLUSH).await;
        let _ = self.shutdown.send(());
        for task in self.tasks {
            task.abort();
        }
    }
}
