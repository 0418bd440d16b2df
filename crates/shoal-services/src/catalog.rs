//! Content catalog: peers, files, chunk holders, and local shares.
//!
//! The catalog is the one shared mutable resource in a node; discovery, the
//! router, the sync loop, and transfer tasks all write to it concurrently.
//! [`MemoryCatalog`] backs every table with a `DashMap` keyed by entity id,
//! so writes to one peer row or one file's holder table serialize on that
//! entry's lock without blocking anything else. [`CatalogStore`] is the seam
//! a persistent backend would implement instead.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shoal_core::content::FileId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unknown file {0}")]
    UnknownFile(FileId),
    #[error("chunk index {index} out of range for {file_id} ({chunk_count} chunks)")]
    IndexOutOfRange {
        file_id: FileId,
        index: u32,
        chunk_count: u32,
    },
}

// ── Records ─────────────────────────────────────────────────────────────────

/// A peer this node has heard from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub address: IpAddr,
    /// TCP port the peer accepts connections on.
    pub port: u16,
    /// Wall clock of the last beacon or message from this peer. Only ever
    /// moves forward; a stale announce cannot rewind it.
    pub last_seen: SystemTime,
    /// Set when sends to this peer exhaust their retries, cleared on the next
    /// contact. A flag, not a deletion: the row survives for reconnects.
    pub unreachable: bool,
}

/// A file known to the network, keyed by its content-derived id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    /// Whole-file hash, lowercase hex.
    pub content_hash: String,
    pub chunk_count: u32,
}

/// Holder state for one chunk index of one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkHolderEntry {
    /// Verified hash for this index. Written once; a later disagreeing
    /// report does not replace it.
    pub hash: Option<String>,
    /// Peers claiming this chunk, in first-seen order.
    pub holders: Vec<String>,
}

/// Outcome of [`CatalogStore::record_chunk_holder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderUpdate {
    /// Holder listed (or already listed) and consistent with the recorded hash.
    Accepted,
    /// Holder reported a hash conflicting with the one on record and was
    /// dropped from this index. Its claims on other indexes stand.
    HashConflict,
}

// ── Store interface ─────────────────────────────────────────────────────────

/// Storage behind the catalog. Implementations must be safe to call from
/// concurrent tasks and must serialize writes touching the same key.
pub trait CatalogStore: Send + Sync {
    fn upsert_peer(&self, peer: PeerRecord) -> Result<(), StorageError>;
    fn get_peer(&self, peer_id: &str) -> Option<PeerRecord>;
    /// Peers heard from within `timeout`.
    fn list_peers(&self, timeout: Duration) -> Vec<PeerRecord>;
    /// Remove a peer row. Returns whether a row existed.
    fn delete_peer(&self, peer_id: &str) -> bool;
    fn set_peer_unreachable(&self, peer_id: &str, unreachable: bool);
    /// Drop rows silent for longer than `older_than`; returns how many went.
    fn purge_stale_peers(&self, older_than: Duration) -> usize;

    /// Insert a file record if absent. Identical content carries identical
    /// metadata, so an existing row (and its holder table) is left alone.
    fn upsert_file(&self, file: FileRecord) -> Result<(), StorageError>;
    fn get_file(&self, file_id: &FileId) -> Option<FileRecord>;
    fn list_all_files(&self) -> Vec<FileRecord>;
    /// Files for which `peer_id` holds at least one chunk.
    fn list_files_by_owner(&self, peer_id: &str) -> Vec<FileRecord>;

    /// Add `peer_id` as a holder of one chunk. `hash` of `None` is a bare
    /// claim (file list gossip); `Some` is a verified observation, recorded
    /// for the index if none is yet, checked against it otherwise.
    fn record_chunk_holder(
        &self,
        file_id: &FileId,
        index: u32,
        hash: Option<&str>,
        peer_id: &str,
    ) -> Result<HolderUpdate, StorageError>;
    /// Holder table for every chunk of a file, indexed by chunk order.
    fn list_chunk_holders(&self, file_id: &FileId) -> Result<Vec<ChunkHolderEntry>, StorageError>;

    /// Remember where a file this node shares lives on disk. The file must
    /// already have a catalog record.
    fn add_local_share(&self, file_id: &FileId, path: &Path) -> Result<(), StorageError>;
    /// Forget a local share. Returns whether one existed.
    fn remove_local_share(&self, file_id: &FileId) -> bool;
    fn get_local_share(&self, file_id: &FileId) -> Option<PathBuf>;
    fn list_local_shares(&self) -> Vec<(FileId, PathBuf)>;
}

// ── In-memory implementation ────────────────────────────────────────────────

struct FileEntry {
    record: FileRecord,
    /// One slot per chunk index, allocated when the record is created.
    chunks: Vec<ChunkHolderEntry>,
}

/// The store a running node uses. All state is process-local.
#[derive(Default)]
pub struct MemoryCatalog {
    peers: DashMap<String, PeerRecord>,
    files: DashMap<FileId, FileEntry>,
    local_shares: DashMap<FileId, PathBuf>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl CatalogStore for MemoryCatalog {
    fn upsert_peer(&self, peer: PeerRecord) -> Result<(), StorageError> {
        match self.peers.entry(peer.peer_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let row = occupied.get_mut();
                row.address = peer.address;
                row.port = peer.port;
                row.unreachable = peer.unreachable;
                if peer.last_seen > row.last_seen {
                    row.last_seen = peer.last_seen;
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(peer);
            }
        }
        Ok(())
    }

    fn get_peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|row| row.value().clone())
    }

    fn list_peers(&self, timeout: Duration) -> Vec<PeerRecord> {
        let now = SystemTime::now();
        self.peers
            .iter()
            .filter(|row| {
                // A last_seen ahead of our clock counts as fresh.
                now.duration_since(row.value().last_seen)
                    .map(|age| age < timeout)
                    .unwrap_or(true)
            })
            .map(|row| row.value().clone())
            .collect()
    }

    fn delete_peer(&self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    fn set_peer_unreachable(&self, peer_id: &str, unreachable: bool) {
        if let Some(mut row) = self.peers.get_mut(peer_id) {
            row.unreachable = unreachable;
        }
    }

    fn purge_stale_peers(&self, older_than: Duration) -> usize {
        let now = SystemTime::now();
        let before = self.peers.len();
        self.peers.retain(|_, row| {
            now.duration_since(row.last_seen)
                .map(|age| age < older_than)
                .unwrap_or(true)
        });
        before.saturating_sub(self.peers.len())
    }

    fn upsert_file(&self, file: FileRecord) -> Result<(), StorageError> {
        if let Entry::Vacant(vacant) = self.files.entry(file.file_id.clone()) {
            let chunks = vec![ChunkHolderEntry::default(); file.chunk_count as usize];
            vacant.insert(FileEntry {
                record: file,
                chunks,
            });
        }
        Ok(())
    }

    fn get_file(&self, file_id: &FileId) -> Option<FileRecord> {
        self.files.get(file_id).map(|entry| entry.record.clone())
    }

    fn list_all_files(&self) -> Vec<FileRecord> {
        self.files
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    fn list_files_by_owner(&self, peer_id: &str) -> Vec<FileRecord> {
        self.files
            .iter()
            .filter(|entry| {
                entry
                    .chunks
                    .iter()
                    .any(|slot| slot.holders.iter().any(|holder| holder == peer_id))
            })
            .map(|entry| entry.record.clone())
            .collect()
    }

    fn record_chunk_holder(
        &self,
        file_id: &FileId,
        index: u32,
        hash: Option<&str>,
        peer_id: &str,
    ) -> Result<HolderUpdate, StorageError> {
        let mut entry = self
            .files
            .get_mut(file_id)
            .ok_or_else(|| StorageError::UnknownFile(file_id.clone()))?;
        let chunk_count = entry.record.chunk_count;
        let slot = entry
            .chunks
            .get_mut(index as usize)
            .ok_or(StorageError::IndexOutOfRange {
                file_id: file_id.clone(),
                index,
                chunk_count,
            })?;

        if let Some(reported) = hash {
            match &slot.hash {
                Some(recorded) if recorded != reported => {
                    slot.holders.retain(|holder| holder != peer_id);
                    tracing::warn!(
                        %file_id,
                        chunk_index = index,
                        peer_id,
                        "holder hash disagrees with recorded hash, dropping holder for this chunk"
                    );
                    return Ok(HolderUpdate::HashConflict);
                }
                Some(_) => {}
                None => slot.hash = Some(reported.to_string()),
            }
        }
        if !slot.holders.iter().any(|holder| holder == peer_id) {
            slot.holders.push(peer_id.to_string());
        }
        Ok(HolderUpdate::Accepted)
    }

    fn list_chunk_holders(&self, file_id: &FileId) -> Result<Vec<ChunkHolderEntry>, StorageError> {
        self.files
            .get(file_id)
            .map(|entry| entry.chunks.clone())
            .ok_or_else(|| StorageError::UnknownFile(file_id.clone()))
    }

    fn add_local_share(&self, file_id: &FileId, path: &Path) -> Result<(), StorageError> {
        if !self.files.contains_key(file_id) {
            return Err(StorageError::UnknownFile(file_id.clone()));
        }
        self.local_shares
            .insert(file_id.clone(), path.to_path_buf());
        Ok(())
    }

    fn remove_local_share(&self, file_id: &FileId) -> bool {
        self.local_shares.remove(file_id).is_some()
    }

    fn get_local_share(&self, file_id: &FileId) -> Option<PathBuf> {
        self.local_shares
            .get(file_id)
            .map(|path| path.value().clone())
    }

    fn list_local_shares(&self) -> Vec<(FileId, PathBuf)> {
        self.local_shares
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
