//! shoald: decentralized LAN file-sharing daemon.

use anyhow::Result;

use shoal_core::config::ShoalConfig;
use shoald::Node;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ShoalConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ShoalConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ShoalConfig::default()
    });

    let node = Node::start(config).await?;

    // Paths given on the command line are shared at startup.
    for arg in std::env::args().skip(1) {
        match node.share(std::path::Path::new(&arg)) {
            Ok(record) => {
                tracing::info!(file_id = %record.file_id, filename = %record.filename, "sharing");
            }
            Err(err) => tracing::warn!(path = arg, error = %err, "share failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.shutdown().await;

    Ok(())
}
