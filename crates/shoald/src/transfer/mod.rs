//! Chunked transfer engine.
//!
//! A download plans against the catalog (which chunks, who holds them, which
//! hashes are on record), fetches chunks in parallel from rotating holders,
//! verifies every chunk and then the assembled whole, and only then writes
//! the destination file atomically. Progress and the terminal outcome stream
//! through a [`DownloadHandle`].

pub mod engine;
pub mod pending;

pub use engine::{DownloadHandle, TransferEngine};
pub use pending::{ChunkReply, PendingChunks};

use std::path::PathBuf;

use thiserror::Error;

use shoal_core::FileId;
use shoal_services::{IngestError, StorageError};

/// Progress snapshot for an active download. Percent is monotonic and ends
/// at exactly 100.0 when every chunk has landed.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub file_id: FileId,
    pub chunks_received: u32,
    pub chunks_total: u32,
    pub percent: f64,
    /// Observed throughput in bytes per second, once measurable.
    pub rate: Option<f64>,
}

/// Events emitted by a download task. Exactly one terminal event (`Done`,
/// `Failed`, or `Cancelled`) ends the stream.
#[derive(Debug)]
pub enum TransferEvent {
    Progress(Progress),
    Done { path: PathBuf },
    Failed(TransferError),
    Cancelled,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file {0} is not in the catalog")]
    NotFound(FileId),
    #[error("no holder could serve chunk {chunk_index} of {file_id}")]
    NoHolders { file_id: FileId, chunk_index: u32 },
    #[error("chunk {chunk_index} of {file_id} failed verification against every holder")]
    Integrity { file_id: FileId, chunk_index: u32 },
    #[error("assembled {file_id} hashed to {actual}, expected {expected}")]
    Corruption {
        file_id: FileId,
        expected: String,
        actual: String,
    },
    #[error("download of {0} cancelled")]
    Cancelled(FileId),
    #[error("download of {0} is already active")]
    AlreadyActive(FileId),
    #[error("writing the destination failed: {0}")]
    Write(#[from] IngestError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
