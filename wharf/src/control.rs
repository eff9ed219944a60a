//! Control protocol for wharfd <-> wharfctl over a Unix domain socket.
//!
//! Requests and responses travel as one JSON document per line.

use serde::{Deserialize, Serialize};

use crate::config::ExportConfig;
use crate::daemon::ExportInfo;

/// Request from wharfctl to wharfd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Create an export and bind its name.
    ExportAdd(ExportConfig),
    /// Unbind an export, force-closing any attached clients.
    ExportRemove { name: String },
    /// Enumerate exports in binding order.
    ExportList,
    /// Get daemon status.
    Status,
}

/// Response from wharfd to wharfctl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Exports(Vec<ExportInfo>),
    Status(DaemonStatus),
}

/// Daemon status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// NBD listen address.
    pub nbd_address: String,
    /// Number of bound exports.
    pub export_count: usize,
    /// Connections currently being served.
    pub active_connections: usize,
}
