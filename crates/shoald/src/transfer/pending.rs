//! Pending chunk-request table.
//!
//! Fetch tasks park a oneshot here keyed by `(file_id, chunk_index)`; the
//! router completes it when the matching CHUNK_DATA or CHUNK_NOT_FOUND
//! arrives. Replies nobody is waiting for bounce off harmlessly.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use shoal_core::FileId;

/// Reply delivered to a waiting fetch.
#[derive(Debug)]
pub enum ChunkReply {
    Data {
        bytes: Vec<u8>,
        /// Hash claimed by the holder; the fetch re-verifies it.
        hash: String,
        holder: String,
    },
    NotFound {
        holder: String,
    },
}

/// In-flight chunk requests. One waiter per key; clones share the table.
#[derive(Clone, Default)]
pub struct PendingChunks {
    inner: Arc<DashMap<(FileId, u32), oneshot::Sender<ChunkReply>>>,
}

impl PendingChunks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in one chunk. Replacing a stale waiter drops it,
    /// which its owner observes as a closed channel.
    pub fn register(&self, file_id: &FileId, index: u32) -> oneshot::Receiver<ChunkReply> {
        let (tx, rx) = oneshot::channel();
        if self.inner.insert((file_id.clone(), index), tx).is_some() {
            tracing::debug!(%file_id, index, "replaced stale chunk waiter");
        }
        rx
    }

    /// Deliver a reply. Returns false when nobody was waiting for that key.
    pub fn complete(&self, file_id: &FileId, index: u32, reply: ChunkReply) -> bool {
        match self.inner.remove(&(file_id.clone(), index)) {
            Some((_, waiter)) => waiter.send(reply).is_ok(),
            None => false,
        }
    }

    /// Withdraw interest after a timeout or cancellation, so a late reply is
    /// dropped instead of delivered to nobody.
    pub fn forget(&self, file_id: &FileId, index: u32) {
        self.inner.remove(&(file_id.clone(), index));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
