//! Transfer-port acceptor.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::{connection, Transport};

/// Accepts inbound peer connections and hands each to a connection task pair.
pub struct TransportListener {
    listener: TcpListener,
    transport: Transport,
    shutdown: broadcast::Receiver<()>,
}

impl TransportListener {
    /// The listener socket is bound by the caller so an OS-assigned port is
    /// known before anything announces it.
    pub fn new(listener: TcpListener, transport: Transport, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            listener,
            transport,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let addr = self
            .listener
            .local_addr()
            .context("transfer listener has no local address")?;
        tracing::info!(%addr, "transfer listener ready");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("transfer listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            tracing::debug!(addr = %peer_addr, "inbound connection");
                            connection::spawn(self.transport.clone(), stream, peer_addr, None);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }
}
