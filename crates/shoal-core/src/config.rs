//! Daemon configuration.
//!
//! Loaded from a TOML file (default `$XDG_CONFIG_HOME/shoal/config.toml`),
//! then overridden by `SHOAL_<SECTION>__<FIELD>` environment variables.
//! Every field has a default, so an empty or missing file yields a working
//! node.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] io::Error),
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to write config to {}: {}", .0.display(), .1)]
    WriteFailed(PathBuf, #[source] io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoalConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable peer identity. Empty = generate a fresh id at startup.
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port beacons are broadcast to and received on.
    pub discovery_port: u16,
    /// TCP port for peer connections. 0 = OS-assigned.
    pub transfer_port: u16,
    /// Seconds between discovery beacons.
    pub broadcast_interval_secs: u64,
    /// Seconds of silence before a peer stops counting as online.
    pub liveness_timeout_secs: u64,
    /// Seconds between catalog sync rounds (file list requests).
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes. Must be positive; changing it changes chunk
    /// hashes, so peers sharing content should agree on it.
    pub chunk_size: u64,
    /// Concurrent chunk fetches per download.
    pub max_parallel_downloads: usize,
    /// Seconds to wait for a chunk reply before trying the next holder.
    pub request_timeout_secs: u64,
    /// Send attempts per record before a peer is flagged unreachable.
    pub send_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where completed downloads land.
    pub download_dir: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: 5000,
            transfer_port: 5001,
            broadcast_interval_secs: 10,
            liveness_timeout_secs: 30,
            sync_interval_secs: 15,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 262_144,
            max_parallel_downloads: 5,
            request_timeout_secs: 10,
            send_retries: 3,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl NetworkConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl TransferConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ShoalConfig {
    /// Load from disk, falling back to defaults when no file exists, then
    /// apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let raw =
                fs::read_to_string(&path).map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Path of the config file: `$SHOAL_CONFIG` or the XDG default.
    pub fn file_path() -> PathBuf {
        if let Ok(path) = env::var("SHOAL_CONFIG") {
            return PathBuf::from(path);
        }
        config_dir().join("config.toml")
    }

    /// Write a default config for the user to edit, unless one exists.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(parent.to_path_buf(), e))?;
        }
        let rendered = toml::to_string_pretty(&Self::default())?;
        fs::write(&path, rendered).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        Ok(path)
    }

    /// `SHOAL_<SECTION>__<FIELD>` environment overrides for the fields worth
    /// flipping per-invocation.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("SHOAL_IDENTITY__PEER_ID") {
            self.identity.peer_id = v;
        }
        if let Ok(v) = env::var("SHOAL_NETWORK__DISCOVERY_PORT") {
            if let Ok(port) = v.parse() {
                self.network.discovery_port = port;
            }
        }
        if let Ok(v) = env::var("SHOAL_NETWORK__TRANSFER_PORT") {
            if let Ok(port) = v.parse() {
                self.network.transfer_port = port;
            }
        }
        if let Ok(v) = env::var("SHOAL_NETWORK__BROADCAST_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.network.broadcast_interval_secs = secs;
            }
        }
        if let Ok(v) = env::var("SHOAL_NETWORK__LIVENESS_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.network.liveness_timeout_secs = secs;
            }
        }
        if let Ok(v) = env::var("SHOAL_TRANSFER__CHUNK_SIZE") {
            if let Ok(size) = v.parse() {
                self.transfer.chunk_size = size;
            }
        }
        if let Ok(v) = env::var("SHOAL_TRANSFER__MAX_PARALLEL_DOWNLOADS") {
            if let Ok(n) = v.parse() {
                self.transfer.max_parallel_downloads = n;
            }
        }
        if let Ok(v) = env::var("SHOAL_STORAGE__DOWNLOAD_DIR") {
            self.storage.download_dir = PathBuf::from(v);
        }
    }
}

/// `$XDG_CONFIG_HOME/shoal`, falling back to `~/.config/shoal`.
pub fn config_dir() -> PathBuf {
    dirs_or_home("XDG_CONFIG_HOME", ".config").join("shoal")
}

/// `$XDG_DATA_HOME/shoal`, falling back to `~/.local/share/shoal`.
pub fn data_dir() -> PathBuf {
    dirs_or_home("XDG_DATA_HOME", ".local/share").join("shoal")
}

fn dirs_or_home(var: &str, fallback: &str) -> PathBuf {
    if let Ok(dir) = env::var(var) {
        return PathBuf::from(dir);
    }
    let home = env::var("HOME").unwrap_or_else(|_| String::from("/tmp"));
    Path::new(&home).join(fallback)
}
