//! shoal-services: the node's local state and content services.
//!
//! The catalog holds everything a node knows (peers, files, chunk holders,
//! local shares); the directory is the liveness view over its peer table; the
//! ingester turns local files into shareable chunked content and back.

pub mod catalog;
pub mod directory;
pub mod ingest;

pub use catalog::{
    CatalogStore, ChunkHolderEntry, FileRecord, HolderUpdate, MemoryCatalog, PeerRecord,
    StorageError,
};
pub use directory::PeerDirectory;
pub use ingest::{ChunkPayload, Ingester, IngestError, ScannedFile};
