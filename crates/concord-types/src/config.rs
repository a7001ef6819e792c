//! Transport configuration, loaded from `~/.concord/config.toml` with defaults.
//!
//! Only the `[wire]` table is read. Every field is optional; anything missing
//! falls back to [`WireConfig::default`]. A file that cannot be read, parsed,
//! or validated is logged and replaced by the defaults rather than aborting
//! startup.

use crate::error::{ConcordError, ConcordResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Largest frame payload accepted on the wire (32 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 32 * 1024 * 1024;

/// Default idle timeout for a single socket read or write (seconds).
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 10;

/// Default consensus update cadence (milliseconds).
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 20;

/// Default interval after which an idle writer emits a keepalive (seconds).
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 3;

/// Settings for the TCP transport and the consensus coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Address the agent listens on for inbound peers.
    pub listen_addr: SocketAddr,
    /// Idle timeout for each socket read.
    pub read_timeout_secs: u64,
    /// Idle timeout for each socket write.
    pub write_timeout_secs: u64,
    /// Timeout for establishing an outbound connection.
    pub connect_timeout_secs: u64,
    /// Maximum frame payload length in bytes.
    pub max_message_size: u32,
    /// Interval between consensus engine updates.
    pub update_interval_ms: u64,
    /// How long the writer may stay silent before sending a keepalive.
    pub keepalive_interval_secs: u64,
    /// Drop consensus traffic from peers that have not completed the
    /// public-key handshake.
    pub require_authenticated_consensus: bool,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            read_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            max_message_size: MAX_MESSAGE_SIZE,
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            require_authenticated_consensus: true,
        }
    }
}

impl WireConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Check that every value is usable.
    ///
    /// The keepalive must fire before the remote read timeout would,
    /// otherwise quiet links get torn down by the peer.
    pub fn validate(&self) -> ConcordResult<()> {
        if self.read_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return Err(ConcordError::Config(
                "read and write timeouts must be non-zero".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConcordError::Config(
                "connect timeout must be non-zero".into(),
            ));
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_MESSAGE_SIZE {
            return Err(ConcordError::Config(format!(
                "max_message_size must be in 1..={MAX_MESSAGE_SIZE}, got {}",
                self.max_message_size
            )));
        }
        if self.update_interval_ms == 0 {
            return Err(ConcordError::Config(
                "update interval must be non-zero".into(),
            ));
        }
        if self.keepalive_interval_secs == 0
            || self.keepalive_interval_secs >= self.read_timeout_secs
        {
            return Err(ConcordError::Config(format!(
                "keepalive interval ({}s) must be non-zero and shorter than the read timeout ({}s)",
                self.keepalive_interval_secs, self.read_timeout_secs
            )));
        }
        Ok(())
    }
}

/// On-disk layout: settings live under `[wire]`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    wire: WireConfig,
}

/// Parse a TOML document into a validated [`WireConfig`].
pub fn parse_config(contents: &str) -> ConcordResult<WireConfig> {
    let file: ConfigFile =
        toml::from_str(contents).map_err(|e| ConcordError::Config(e.to_string()))?;
    file.wire.validate()?;
    Ok(file.wire)
}

/// Load transport configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> WireConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return WireConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return WireConfig::default();
        }
    };

    match parse_config(&contents) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Invalid config, using defaults"
            );
            WireConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    concord_home().join("config.toml")
}

/// Get the default Concord home directory.
pub fn concord_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".concord")
}
