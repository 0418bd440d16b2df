//! Peer directory: the liveness view over the catalog's peer table.
//!
//! Discovery and the router write through this type so the self-skip, the
//! monotonic refresh, and departure handling live in one place. Clones are
//! cheap and share the same store.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::catalog::{CatalogStore, PeerRecord};

/// Rows are purged after this many liveness timeouts of silence. Well past
/// "offline", so a flapping peer keeps its row across short outages.
const PURGE_FACTOR: u32 = 10;

#[derive(Clone)]
pub struct PeerDirectory {
    store: Arc<dyn CatalogStore>,
    local_peer_id: String,
    liveness_timeout: Duration,
}

impl PeerDirectory {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        local_peer_id: impl Into<String>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            store,
            local_peer_id: local_peer_id.into(),
            liveness_timeout,
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Record an announce heard over UDP or TCP. Our own announces are
    /// skipped, so the directory never lists this node.
    pub fn upsert(&self, peer_id: &str, address: IpAddr, port: u16) {
        if peer_id == self.local_peer_id {
            tracing::trace!("ignoring own announcement");
            return;
        }
        let record = PeerRecord {
            peer_id: peer_id.to_string(),
            address,
            port,
            last_seen: SystemTime::now(),
            unreachable: false,
        };
        if let Err(err) = self.store.upsert_peer(record) {
            tracing::warn!(peer_id, error = %err, "peer upsert failed");
        }
    }

    /// Push a peer's liveness forward because any message arrived from it.
    /// Unknown peers are ignored; their announce introduces them.
    pub fn refresh(&self, peer_id: &str) {
        if peer_id == self.local_peer_id {
            return;
        }
        if let Some(mut record) = self.store.get_peer(peer_id) {
            record.last_seen = SystemTime::now();
            record.unreachable = false;
            if let Err(err) = self.store.upsert_peer(record) {
                tracing::warn!(peer_id, error = %err, "peer refresh failed");
            }
        }
    }

    /// Handle an orderly departure: the row goes now, not at timeout.
    pub fn mark_departed(&self, peer_id: &str) {
        if self.store.delete_peer(peer_id) {
            tracing::info!(peer_id, "peer departed");
        }
    }

    /// Flag a peer that exhausted its send retries.
    pub fn mark_unreachable(&self, peer_id: &str) {
        tracing::warn!(peer_id, "peer marked unreachable");
        self.store.set_peer_unreachable(peer_id, true);
    }

    /// Look up a peer's row regardless of liveness.
    pub fn lookup(&self, peer_id: &str) -> Option<PeerRecord> {
        self.store.get_peer(peer_id)
    }

    /// Peers currently considered online. Never contains this node.
    pub fn list_online(&self) -> Vec<PeerRecord> {
        self.store
            .list_peers(self.liveness_timeout)
            .into_iter()
            .filter(|peer| peer.peer_id != self.local_peer_id)
            .collect()
    }

    /// Drop rows silent long past the liveness timeout. Runs from the purge
    /// loop; listing already filters by liveness, so this is just hygiene.
    pub fn purge_stale(&self) -> usize {
        self.store
            .purge_stale_peers(self.liveness_timeout * PURGE_FACTOR)
    }
}
