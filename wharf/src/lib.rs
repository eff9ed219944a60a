//! wharf: a Network Block Device (NBD) export daemon.
//!
//! Exports block volumes (raw image files or memory buffers) to NBD
//! clients. The server speaks the oldstyle and fixed-newstyle handshakes,
//! pipelines a bounded number of in-flight requests per connection, and
//! serves many exports to many clients concurrently.
//!
//! # Library usage
//!
//! ```ignore
//! use wharf::{Config, Daemon};
//!
//! let daemon = Daemon::from_config(config).await?;
//! let listener = tokio::net::TcpListener::bind(daemon.nbd_address()).await?;
//! daemon.listen(listener).await?;
//! ```

pub mod backend;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod export;
pub mod nbd;
pub mod types;

pub use backend::{BlockBackend, FileBackend, MemBackend};
pub use config::{Backing, Config, ExportConfig, LimitsConfig, NbdConfig};
pub use daemon::{Daemon, ExportInfo};
pub use error::{ConfigError, Error, ExportError, NbdError, Result};
pub use export::{Export, ExportOptions, ExportRegistry};
pub use nbd::{ChannelListener, Limits, Listener, NbdServer};
pub use types::SECTOR_SIZE;

pub use wharf_nbd;
