//! Peer discovery over UDP broadcast.
//!
//! The broadcaster announces this node's identity and transfer port on a
//! fixed interval; the listener feeds received beacons into the directory and
//! hosts the stale-row purge. Discovery failing to bind degrades the node
//! (nobody finds us passively) but never takes it down; peers can still be
//! learned over TCP announces.

pub mod broadcast;
pub mod listener;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("discovery socket setup failed: {0}")]
    Socket(#[from] std::io::Error),
}
