//! Application configuration
//!
//! Loaded from a TOML file; every field has a default so a partial (or
//! missing) file yields a usable node.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

/// Handshake listener and client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Address the handshake listener binds to
    pub bind_address: IpAddr,
    /// Handshake port, shared by every node
    pub port: u16,
    /// Source address for outbound handshakes. Peers identify a quitting
    /// participant by this address, so set it on multi-homed hosts.
    pub local_address: Option<IpAddr>,
    pub probe_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: SIGNALING_PORT,
            local_address: None,
            probe_timeout_ms: PROBE_TIMEOUT_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl SignalingConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Media leg and buffer pool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// First UDP port of the media port range
    pub base_port: u16,
    /// Bytes per audio block; must cover the largest expected frame
    pub block_capacity: usize,
    /// Audio blocks allocated per call leg
    pub pool_size: usize,
    /// Wake-up interval while waiting on an exhausted pool
    pub ingest_poll_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_MEDIA_BASE_PORT,
            block_capacity: AUDIO_BLOCK_CAPACITY,
            pool_size: AUDIO_POOL_SIZE,
            ingest_poll_ms: INGEST_POLL_MS,
        }
    }
}

impl MediaConfig {
    pub fn ingest_poll(&self) -> Duration {
        Duration::from_millis(self.ingest_poll_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Default config file location (`<config dir>/voice-node/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "lan-voice-call", "voice-node")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one the default location is
    /// tried and defaults are used when no file is there.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to disk, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, text)
        };
        write().map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.media.pool_size == 0 {
            return Err(ConfigError::Invalid("media.pool_size must be > 0".into()));
        }
        if self.media.block_capacity == 0 {
            return Err(ConfigError::Invalid("media.block_capacity must be > 0".into()));
        }
        if self.media.ingest_poll_ms == 0 {
            return Err(ConfigError::Invalid("media.ingest_poll_ms must be > 0".into()));
        }
        // Two ports per participant index; the last one used is base + 2n - 1
        let top = self.media.base_port as usize + 2 * MAX_PARTICIPANTS - 1;
        if top > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "media.base_port {} leaves no room for {} participants",
                self.media.base_port, MAX_PARTICIPANTS
            )));
        }
        Ok(())
    }
}
