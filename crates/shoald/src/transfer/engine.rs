//! Download coordinator and chunk fetch workers.
//!
//! Each download runs as one coordinator task plus up to `max_parallel`
//! fetch workers. Chunks are assigned to workers by index modulo the worker
//! count, and each worker walks its chunks in order, rotating through the
//! known holders of a chunk until one delivers bytes that verify. Results
//! flow back to the coordinator, which tracks progress, assembles, verifies
//! the whole file, and writes the destination atomically.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use shoal_core::content::{self, FileId};
use shoal_core::protocol::Payload;
use shoal_services::{ingest, CatalogStore, FileRecord};

use crate::transport::Transport;

use super::pending::{ChunkReply, PendingChunks};
use super::{Progress, TransferError, TransferEvent};

/// Starts downloads and enforces one active download per file.
#[derive(Clone)]
pub struct TransferEngine {
    catalog: Arc<dyn CatalogStore>,
    transport: Transport,
    pending: PendingChunks,
    local_peer_id: String,
    max_parallel: usize,
    request_timeout: Duration,
    active: Arc<DashMap<FileId, broadcast::Sender<()>>>,
}

/// Caller's view of one download: an event stream plus a cancel switch.
///
/// Dropping the handle without draining it cancels the download.
#[derive(Debug)]
pub struct DownloadHandle {
    file_id: FileId,
    events: mpsc::Receiver<TransferEvent>,
    cancel: broadcast::Sender<()>,
}

impl DownloadHandle {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Ask the download to stop. Cooperative: in-flight requests finish or
    /// time out, their results are discarded, and a terminal `Cancelled`
    /// event ends the stream. No partial file is left at the destination.
    pub fn cancel(&self) {
        let _ = self.cancel.send(());
    }

    /// Next event; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Drain events until the terminal one and return the outcome.
    pub async fn wait(mut self) -> Result<PathBuf, TransferError> {
        while let Some(event) = self.events.recv().await {
            match event {
                TransferEvent::Progress(_) => {}
                TransferEvent::Done { path } => return Ok(path),
                TransferEvent::Failed(err) => return Err(err),
                TransferEvent::Cancelled => return Err(TransferError::Cancelled(self.file_id)),
            }
        }
        Err(TransferError::Cancelled(self.file_id))
    }
}

impl TransferEngine {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        transport: Transport,
        pending: PendingChunks,
        local_peer_id: String,
        max_parallel: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            transport,
            pending,
            local_peer_id,
            max_parallel,
            request_timeout,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Begin downloading `file_id` to `dest`. The work runs on its own task;
    /// the returned handle streams progress and the terminal outcome.
    pub fn start(&self, file_id: FileId, dest: PathBuf) -> Result<DownloadHandle, TransferError> {
        let record = self
            .catalog
            .get_file(&file_id)
            .ok_or_else(|| TransferError::NotFound(file_id.clone()))?;

        let cancel = match self.active.entry(file_id.clone()) {
            Entry::Occupied(_) => return Err(TransferError::AlreadyActive(file_id)),
            Entry::Vacant(vacant) => {
                let (tx, _) = broadcast::channel(1);
                vacant.insert(tx.clone());
                tx
            }
        };
        // Subscribed before the handle exists, so a cancel() fired right
        // after start() cannot be missed.
        let cancel_rx = cancel.subscribe();
        let (events_tx, events_rx) = mpsc::channel(32);

        let task = DownloadTask {
            catalog: self.catalog.clone(),
            transport: self.transport.clone(),
            pending: self.pending.clone(),
            local_peer_id: self.local_peer_id.clone(),
            max_parallel: self.max_parallel,
            request_timeout: self.request_timeout,
            active: self.active.clone(),
            record,
            dest,
            events: events_tx,
            cancel_rx,
        };
        tokio::spawn(task.run());

        Ok(DownloadHandle {
            file_id,
            events: events_rx,
            cancel,
        })
    }
}

/// What one chunk needs: who to ask, and the hash on record if any.
#[derive(Debug, Clone)]
struct ChunkPlan {
    index: u32,
    holders: Vec<String>,
    recorded_hash: Option<String>,
}

type FetchOutcome = Result<(u32, Vec<u8>), TransferError>;

struct DownloadTask {
    catalog: Arc<dyn CatalogStore>,
    transport: Transport,
    pending: PendingChunks,
    local_peer_id: String,
    max_parallel: usize,
    request_timeout: Duration,
    active: Arc<DashMap<FileId, broadcast::Sender<()>>>,
    record: FileRecord,
    dest: PathBuf,
    events: mpsc::Sender<TransferEvent>,
    cancel_rx: broadcast::Receiver<()>,
}

impl DownloadTask {
    async fn run(mut self) {
        let file_id = self.record.file_id.clone();
        let outcome = self.execute().await;
        self.active.remove(&file_id);

        let terminal = match outcome {
            Ok(path) => {
                tracing::info!(%file_id, path = %path.display(), "download complete");
                TransferEvent::Done { path }
            }
            Err(TransferError::Cancelled(_)) => {
                tracing::info!(%file_id, "download cancelled");
                TransferEvent::Cancelled
            }
            Err(err) => {
                tracing::warn!(%file_id, error = %err, "download failed");
                TransferEvent::Failed(err)
            }
        };
        let _ = self.events.send(terminal).await;
    }

    async fn execute(&mut self) -> Result<PathBuf, TransferError> {
        let file_id = self.record.file_id.clone();
        let total = self.record.chunk_count;

        // Planning: snapshot holders and recorded hashes chunk by chunk.
        // Holder sets can grow while we fetch; this download works from the
        // view it planned with.
        let slots = self.catalog.list_chunk_holders(&file_id)?;
        let mut plans = Vec::with_capacity(total as usize);
        for index in 0..total {
            let slot = slots.get(index as usize).cloned().unwrap_or_default();
            let holders: Vec<String> = slot
                .holders
                .into_iter()
                .filter(|holder| holder != &self.local_peer_id)
                .collect();
            plans.push(ChunkPlan {
                index,
                holders,
                recorded_hash: slot.hash,
            });
        }
        tracing::info!(%file_id, chunks = total, "download planned");

        let started = Instant::now();
        let mut chunks: HashMap<u32, Vec<u8>> = HashMap::with_capacity(total as usize);

        if total > 0 {
            let workers = self.max_parallel.clamp(1, total as usize);
            let (results_tx, mut results_rx) = mpsc::channel::<FetchOutcome>(workers);
            for worker in 0..workers {
                let assigned: Vec<ChunkPlan> = plans
                    .iter()
                    .filter(|plan| plan.index as usize % workers == worker)
                    .cloned()
                    .collect();
                tokio::spawn(fetch_worker(
                    self.transport.clone(),
                    self.pending.clone(),
                    self.catalog.clone(),
                    file_id.clone(),
                    self.request_timeout,
                    assigned,
                    results_tx.clone(),
                ));
            }
            drop(results_tx);

            let mut received: u32 = 0;
            let mut bytes_received: u64 = 0;
            loop {
                tokio::select! {
                    _ = self.cancel_rx.recv() => {
                        return Err(TransferError::Cancelled(file_id));
                    }
                    outcome = results_rx.recv() => {
                        // Workers stopping early without a failure cannot
                        // happen, but a closed channel must not hang us.
                        let Some(outcome) = outcome else { break };
                        let (index, bytes) = outcome?;
                        bytes_received += bytes.len() as u64;
                        chunks.insert(index, bytes);
                        received += 1;

                        let secs = started.elapsed().as_secs_f64();
                        let progress = Progress {
                            file_id: file_id.clone(),
                            chunks_received: received,
                            chunks_total: total,
                            percent: f64::from(received) / f64::from(total) * 100.0,
                            rate: if secs > 0.0 {
                                Some(bytes_received as f64 / secs)
                            } else {
                                None
                            },
                        };
                        if self.events.send(TransferEvent::Progress(progress)).await.is_err() {
                            // Handle dropped: nobody is listening anymore.
                            return Err(TransferError::Cancelled(file_id));
                        }
                        if received == total {
                            break;
                        }
                    }
                }
            }
            if received < total {
                return Err(TransferError::Cancelled(file_id));
            }
        }

        // Verifying: the assembled whole must hash to the advertised content
        // hash before anything touches the destination.
        self.check_cancelled(&file_id)?;
        tracing::debug!(%file_id, "verifying assembled content");
        let mut data = Vec::with_capacity(self.record.size as usize);
        for index in 0..total {
            data.extend_from_slice(&chunks.remove(&index).unwrap_or_default());
        }
        let actual = content::content_hash(&data);
        if actual != self.record.content_hash {
            return Err(TransferError::Corruption {
                file_id,
                expected: self.record.content_hash.clone(),
                actual,
            });
        }

        if total == 0 {
            // An empty file has no chunk events; still report completion.
            let _ = self
                .events
                .send(TransferEvent::Progress(Progress {
                    file_id: file_id.clone(),
                    chunks_received: 0,
                    chunks_total: 0,
                    percent: 100.0,
                    rate: None,
                }))
                .await;
        }

        ingest::write_atomic(&self.dest, &data)?;
        Ok(self.dest.clone())
    }

    fn check_cancelled(&mut self, file_id: &FileId) -> Result<(), TransferError> {
        use tokio::sync::broadcast::error::TryRecvError;
        match self.cancel_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Lagged(_)) => {
                Err(TransferError::Cancelled(file_id.clone()))
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => Ok(()),
        }
    }
}

/// Fetch the chunks assigned to one worker, in order. Stops early when the
/// coordinator is gone (download failed or was cancelled).
async fn fetch_worker(
    transport: Transport,
    pending: PendingChunks,
    catalog: Arc<dyn CatalogStore>,
    file_id: FileId,
    request_timeout: Duration,
    assigned: Vec<ChunkPlan>,
    results: mpsc::Sender<FetchOutcome>,
) {
    for plan in assigned {
        let outcome = fetch_chunk(
            &transport,
            &pending,
            catalog.as_ref(),
            &file_id,
            plan,
            request_timeout,
        )
        .await;
        if results.send(outcome).await.is_err() {
            return;
        }
    }
}

/// Fetch one chunk, rotating through its holders until one delivers bytes
/// that verify. Each holder is tried at most once; a failure of any kind
/// (undeliverable request, refusal, timeout, bad bytes) moves to the next.
async fn fetch_chunk(
    transport: &Transport,
    pending: &PendingChunks,
    catalog: &dyn CatalogStore,
    file_id: &FileId,
    plan: ChunkPlan,
    request_timeout: Duration,
) -> FetchOutcome {
    let ChunkPlan {
        index,
        holders,
        mut recorded_hash,
    } = plan;

    if holders.is_empty() {
        return Err(TransferError::NoHolders {
            file_id: file_id.clone(),
            chunk_index: index,
        });
    }

    let mut integrity_failure = false;
    // Offset the rotation by the chunk index so concurrent chunks spread
    // their first requests across the swarm.
    let start = index as usize % holders.len();

    for step in 0..holders.len() {
        let holder = &holders[(start + step) % holders.len()];
        let reply_rx = pending.register(file_id, index);

        let request = Payload::ChunkRequest {
            file_id: file_id.clone(),
            chunk_index: index,
        };
        if let Err(err) = transport.send(holder, request).await {
            tracing::debug!(%file_id, chunk_index = index, holder, error = %err, "chunk request not delivered");
            pending.forget(file_id, index);
            continue;
        }

        match tokio::time::timeout(request_timeout, reply_rx).await {
            Ok(Ok(ChunkReply::Data {
                bytes,
                hash,
                holder: from,
            })) => {
                let computed = content::content_hash(&bytes);
                if computed != hash {
                    tracing::warn!(%file_id, chunk_index = index, holder = %from, "chunk bytes do not match their claimed hash");
                    integrity_failure = true;
                    continue;
                }
                if let Some(expected) = &recorded_hash {
                    if &computed != expected {
                        tracing::warn!(%file_id, chunk_index = index, holder = %from, "chunk disagrees with the recorded hash");
                        // The catalog drops this holder for this index.
                        let _ = catalog.record_chunk_holder(file_id, index, Some(&computed), &from);
                        integrity_failure = true;
                        continue;
                    }
                } else {
                    recorded_hash = Some(computed.clone());
                }
                // Verified: remember the hash (first write wins) and the
                // holder that actually served it.
                if let Err(err) = catalog.record_chunk_holder(file_id, index, Some(&computed), &from)
                {
                    tracing::debug!(%file_id, chunk_index = index, error = %err, "holder record failed");
                }
                return Ok((index, bytes));
            }
            Ok(Ok(ChunkReply::NotFound { holder: from })) => {
                tracing::debug!(%file_id, chunk_index = index, holder = %from, "holder does not have the chunk");
            }
            Ok(Err(_)) => {
                tracing::debug!(%file_id, chunk_index = index, holder, "chunk wait dropped");
                pending.forget(file_id, index);
            }
            Err(_) => {
                tracing::debug!(%file_id, chunk_index = index, holder, "chunk request timed out");
                pending.forget(file_id, index);
            }
        }
    }

    if integrity_failure {
        Err(TransferError::Integrity {
            file_id: file_id.clone(),
            chunk_index: index,
        })
    } else {
        Err(TransferError::NoHolders {
            file_id: file_id.clone(),
            chunk_index: index,
        })
    }
}
