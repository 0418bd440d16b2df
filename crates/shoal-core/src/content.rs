//! Content identity: hashing and id derivation.
//!
//! All hashes are BLAKE3 and travel as lowercase hex strings. A file's id is
//! derived from its content hash, so two peers that independently share the
//! same bytes produce the same `FileId` and the catalog folds them into one
//! record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of a rendered [`FileId`] in hex characters.
pub const FILE_ID_HEX_LEN: usize = 16;

/// Hash a byte slice, returning the lowercase hex digest.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Incremental hasher for content that arrives in pieces.
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize().as_bytes())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Content-derived file identifier.
///
/// The id is the first 8 bytes of `blake3(content_hash)`, hex encoded: fixed
/// width, safe in filenames and log lines, and stable across peers for
/// identical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Derive the id for a file whose whole-content hash is `content_hash`.
    pub fn from_content_hash(content_hash: &str) -> Self {
        let digest = blake3::hash(content_hash.as_bytes());
        Self(hex::encode(&digest.as_bytes()[..FILE_ID_HEX_LEN / 2]))
    }

    /// Wrap an id received off the wire or read from a store row.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of chunks a file of `size` bytes splits into at `chunk_size`.
///
/// An empty file has zero chunks. `chunk_size` must be nonzero; the daemon
/// validates that once at startup.
pub fn chunk_count(size: u64, chunk_size: u64) -> u32 {
    size.div_ceil(chunk_size) as u32
}
