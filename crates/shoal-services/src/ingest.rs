//! Content ingest: chunking local files into the catalog and the inverse,
//! writing verified downloads to disk.
//!
//! Sharing a file reads it once, hashing every `chunk_size` block and the
//! whole stream in the same pass. The resulting record, per-chunk hashes, and
//! the on-disk path all land in the catalog, after which the node serves the
//! file's chunks to anyone who asks.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::catalog::{CatalogStore, FileRecord, StorageError};
use shoal_core::content::{self, FileId};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error on {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn io_err(path: &Path, source: std::io::Error) -> IngestError {
    IngestError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A file scanned for sharing: its catalog record plus per-chunk hashes in
/// chunk order.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub record: FileRecord,
    pub chunk_hashes: Vec<String>,
}

/// One chunk read back from a shared file, with its hash.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub data: Vec<u8>,
    pub hash: String,
}

/// Read `path` once, hashing each `chunk_size` block and the whole content.
pub fn scan_file(path: &Path, chunk_size: u64) -> Result<ScannedFile, IngestError> {
    let mut file = fs::File::open(path).map_err(|e| io_err(path, e))?;
    let mut whole = content::Hasher::new();
    let mut chunk_hashes = Vec::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; chunk_size as usize];

    loop {
        let n = read_block(&mut file, &mut buf).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        whole.update(block);
        chunk_hashes.push(content::content_hash(block));
        size += n as u64;
    }

    let content_hash = whole.finalize();
    let file_id = FileId::from_content_hash(&content_hash);
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    Ok(ScannedFile {
        record: FileRecord {
            file_id,
            filename,
            size,
            content_hash,
            chunk_count: chunk_hashes.len() as u32,
        },
        chunk_hashes,
    })
}

/// Fill `buf` from the reader, stopping only at EOF. Returns bytes read, so
/// the final block of a file comes back short.
fn read_block(file: &mut fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Registers local files as shared content and serves their chunks.
#[derive(Clone)]
pub struct Ingester {
    store: Arc<dyn CatalogStore>,
    local_peer_id: String,
    chunk_size: u64,
}

impl Ingester {
    pub fn new(store: Arc<dyn CatalogStore>, local_peer_id: impl Into<String>, chunk_size: u64) -> Self {
        Self {
            store,
            local_peer_id: local_peer_id.into(),
            chunk_size,
        }
    }

    /// Share a file: scan it, register the record, list this node as holder
    /// of every chunk, and remember the on-disk path.
    ///
    /// Sharing the same content twice folds into the existing record; the
    /// stored path follows the latest call.
    pub fn ingest(&self, path: &Path) -> Result<FileRecord, IngestError> {
        let scanned = scan_file(path, self.chunk_size)?;
        // Chunks get served from any working directory later.
        let canonical = fs::canonicalize(path).map_err(|e| io_err(path, e))?;

        let record = scanned.record.clone();
        self.store.upsert_file(scanned.record)?;
        for (index, hash) in scanned.chunk_hashes.iter().enumerate() {
            self.store.record_chunk_holder(
                &record.file_id,
                index as u32,
                Some(hash),
                &self.local_peer_id,
            )?;
        }
        self.store.add_local_share(&record.file_id, &canonical)?;

        tracing::info!(
            file_id = %record.file_id,
            filename = %record.filename,
            size = record.size,
            chunks = record.chunk_count,
            "file shared"
        );
        Ok(record)
    }

    /// Stop sharing. The file's catalog record survives (other peers may
    /// still hold it); this node just stops serving and advertising it.
    pub fn unshare(&self, file_id: &FileId) -> bool {
        let removed = self.store.remove_local_share(file_id);
        if removed {
            tracing::info!(%file_id, "file unshared");
        }
        removed
    }

    /// Serve one chunk of a shared file. `Ok(None)` means "not holding that":
    /// unknown file, not shared here, index out of range, or the file shrank
    /// since ingest.
    pub fn read_chunk(&self, file_id: &FileId, index: u32) -> Result<Option<ChunkPayload>, IngestError> {
        let Some(path) = self.store.get_local_share(file_id) else {
            return Ok(None);
        };
        let Some(record) = self.store.get_file(file_id) else {
            return Ok(None);
        };
        if index >= record.chunk_count {
            return Ok(None);
        }

        let mut file = fs::File::open(&path).map_err(|e| io_err(&path, e))?;
        file.seek(SeekFrom::Start(u64::from(index) * self.chunk_size))
            .map_err(|e| io_err(&path, e))?;
        let mut buf = vec![0u8; self.chunk_size as usize];
        let n = read_block(&mut file, &mut buf).map_err(|e| io_err(&path, e))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        let hash = content::content_hash(&buf);
        Ok(Some(ChunkPayload { data: buf, hash }))
    }
}

/// Write `data` to `dest` through a temp file in the same directory: write,
/// fsync, rename. A crash mid-write leaves a `.part` file, never a truncated
/// destination.
pub fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), IngestError> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }

    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(".part");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&tmp, e));
    }
    drop(file);

    if let Err(e) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(dest, e));
    }
    Ok(())
}
