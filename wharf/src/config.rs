//! Configuration for wharf.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use wharf_nbd::{NBD_MAX_BUFFER_SIZE, NBD_MAX_NAME_SIZE};

use crate::error::ConfigError;
use crate::nbd::Limits;
use crate::types::SECTOR_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nbd: NbdConfig,
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub exports: Vec<ExportConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nbd: NbdConfig::default(),
            socket: default_socket_path(),
            limits: LimitsConfig::default(),
            exports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdConfig {
    #[serde(default = "default_nbd_address")]
    pub address: String,
    /// Connections accepted at once; 0 means unlimited. At the cap the
    /// acceptor stops accepting until a connection closes.
    #[serde(default)]
    pub max_connections: usize,
    /// Preselect this export for every connection and speak the oldstyle
    /// handshake (no option negotiation), the way single-export servers
    /// traditionally do.
    #[serde(default)]
    pub default_export: Option<String>,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            address: default_nbd_address(),
            max_connections: 0,
            default_export: None,
        }
    }
}

/// Per-connection policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_in_flight: usize,
    pub max_request_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_in_flight: limits.max_in_flight,
            max_request_bytes: limits.max_request_bytes,
        }
    }
}

impl LimitsConfig {
    pub fn to_limits(&self) -> Limits {
        Limits {
            max_in_flight: self.max_in_flight,
            max_request_bytes: self.max_request_bytes,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.max_in_flight",
                reason: "must be >= 1",
            });
        }
        if self.max_request_bytes < SECTOR_SIZE || self.max_request_bytes % SECTOR_SIZE != 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.max_request_bytes",
                reason: "must be a positive multiple of the sector size",
            });
        }
        if self.max_request_bytes > NBD_MAX_BUFFER_SIZE as usize {
            return Err(ConfigError::InvalidValue {
                field: "limits.max_request_bytes",
                reason: "must not exceed 32 MiB",
            });
        }
        Ok(())
    }
}

/// One export definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub name: String,
    pub backing: Backing,
    #[serde(default)]
    pub read_only: bool,
    /// Byte offset of the export within its backing volume.
    #[serde(default)]
    pub dev_offset: u64,
    /// Effective size; defaults to everything behind `dev_offset`.
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl ExportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "exports.name",
                reason: "must not be empty",
            });
        }
        if self.name.len() > NBD_MAX_NAME_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "exports.name",
                reason: "must be at most 255 bytes",
            });
        }
        if self.dev_offset % SECTOR_SIZE as u64 != 0 {
            return Err(ConfigError::InvalidValue {
                field: "exports.dev_offset",
                reason: "must be sector-aligned",
            });
        }
        if let Backing::Memory(0) = self.backing {
            return Err(ConfigError::InvalidValue {
                field: "exports.backing",
                reason: "memory size must be > 0",
            });
        }
        Ok(())
    }
}

/// Where an export's bytes live: `file:<path>` or `memory:<bytes>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    File(PathBuf),
    Memory(u64),
}

impl Backing {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        if let Some(path) = s.strip_prefix("file:") {
            if path.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "backing",
                    reason: "file path must not be empty",
                });
            }
            Ok(Self::File(PathBuf::from(path)))
        } else if let Some(size) = s.strip_prefix("memory:") {
            let size = size.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                field: "backing",
                reason: "memory size must be a byte count",
            })?;
            Ok(Self::Memory(size))
        } else {
            let scheme = s.split(':').next().unwrap_or(s).to_string();
            Err(ConfigError::UnsupportedScheme { scheme })
        }
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Memory(size) => write!(f, "memory:{size}"),
        }
    }
}

impl Serialize for Backing {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Backing {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Backing::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn default_nbd_address() -> String {
    "127.0.0.1:10809".to_string()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/wharf/wharfd.sock")
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        for export in &self.exports {
            export.validate()?;
        }
        Ok(())
    }
}
