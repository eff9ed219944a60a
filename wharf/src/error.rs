//! Error types for wharf.

use std::io;
use thiserror::Error;

// Re-export the protocol error from the wire crate
pub use wharf_nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("export error: {0}")]
    Export(#[from] ExportError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Export registry and export construction errors.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export name already in use: {0}")]
    DuplicateName(String),

    #[error("export not found: {0}")]
    NotFound(String),

    #[error("export name is empty")]
    EmptyName,

    #[error("export name too long: {length} bytes (max {max})")]
    NameTooLong { length: usize, max: usize },

    #[error("device offset {dev_offset} is past the end of the image ({backing_len} bytes)")]
    OffsetPastEnd { dev_offset: u64, backing_len: u64 },

    #[error(
        "requested size {requested} exceeds the {available} bytes available behind the offset"
    )]
    SizeTooLarge { requested: u64, available: u64 },

    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("unsupported backing scheme: {scheme}")]
    UnsupportedScheme { scheme: String },
}
