//! Daemon API for running wharf.
//!
//! Builds the export registry from configuration, accepts connections
//! from any [`Listener`], and carries the management operations the
//! control socket exposes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use wharf_nbd::NbdError;

use crate::backend::{BlockBackend, FileBackend, MemBackend};
use crate::config::{Backing, Config, ExportConfig};
use crate::control::DaemonStatus;
use crate::error::{Error, ExportError};
use crate::export::{Export, ExportOptions, ExportRegistry};
use crate::nbd::{Listener, NbdServer};

/// Summary of one export for the management plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportInfo {
    pub name: String,
    pub size_bytes: u64,
    pub read_only: bool,
}

/// A running wharf instance.
#[derive(Clone)]
pub struct Daemon {
    registry: Arc<ExportRegistry>,
    server: NbdServer,
    config: Arc<Config>,
    conn_gate: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
}

impl Daemon {
    /// Create a daemon from configuration, opening every configured
    /// export's backing volume.
    pub async fn from_config(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let registry = Arc::new(ExportRegistry::new());
        for spec in &config.exports {
            let export = build_export(spec).await?;
            registry.bind(export, &spec.name)?;
            info!(name = %spec.name, "export bound");
        }

        if let Some(name) = &config.nbd.default_export {
            if registry.find(name).is_none() {
                return Err(ExportError::NotFound(name.clone()).into());
            }
        }

        let conn_gate = match config.nbd.max_connections {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Ok(Self {
            server: NbdServer::new(Arc::clone(&registry), config.limits.to_limits()),
            registry,
            config: Arc::new(config),
            conn_gate,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn nbd_address(&self) -> &str {
        &self.config.nbd.address
    }

    /// Accept NBD connections from any listener until it closes, spawning
    /// a serving task per connection. At the connection cap the loop
    /// stops accepting until a slot frees up.
    pub async fn listen<L>(&self, mut listener: L) -> Result<(), NbdError>
    where
        L: Listener,
    {
        info!(
            address = %self.config.nbd.address,
            exports = self.registry.len(),
            "NBD server accepting connections"
        );

        loop {
            let permit = match &self.conn_gate {
                Some(gate) => Some(
                    Arc::clone(gate)
                        .acquire_owned()
                        .await
                        .expect("connection gate never closes"),
                ),
                None => None,
            };

            match listener.accept().await {
                Ok(stream) => {
                    // With a default export configured the connection gets
                    // the oldstyle handshake against it; otherwise the
                    // client negotiates.
                    let preselected = match &self.config.nbd.default_export {
                        Some(name) => {
                            let export = self.registry.find(name);
                            if export.is_none() {
                                warn!(name = %name, "default export no longer bound");
                            }
                            export
                        }
                        None => None,
                    };
                    let server = self.server.clone();
                    let active = Arc::clone(&self.active);
                    active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let result = match preselected {
                            Some(export) => server.serve_preselected(stream, export).await,
                            None => server.serve(stream).await,
                        };
                        if let Err(e) = result {
                            // Disconnects mid-request surface as Io; only
                            // protocol trouble is worth a log line.
                            if !matches!(e, NbdError::Io(_)) {
                                warn!(error = %e, "NBD connection error");
                            }
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    // Channel listener ran out of senders - normal exit.
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Create an export from a spec and bind its name.
    pub async fn export_add(&self, spec: &ExportConfig) -> Result<(), Error> {
        spec.validate().map_err(Error::Config)?;
        let export = build_export(spec).await?;
        self.registry.bind(export, &spec.name)?;
        info!(name = %spec.name, "export added");
        Ok(())
    }

    /// Unbind an export, force-closing any attached clients.
    pub fn export_remove(&self, name: &str) -> Result<(), Error> {
        self.registry.remove(name)?;
        info!(name, "export removed");
        Ok(())
    }

    /// Bound exports in binding order.
    pub fn export_list(&self) -> Vec<ExportInfo> {
        self.registry
            .list()
            .iter()
            .filter_map(|export| {
                Some(ExportInfo {
                    name: export.name()?,
                    size_bytes: export.size(),
                    read_only: export.read_only(),
                })
            })
            .collect()
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            nbd_address: self.config.nbd.address.clone(),
            export_count: self.registry.len(),
            active_connections: self.active.load(Ordering::SeqCst),
        }
    }

    /// Tear down every export, force-closing attached clients. Their
    /// connections drain on their own tasks.
    pub fn shutdown(&self) {
        info!("shutting down, closing all exports");
        self.registry.close_all();
    }
}

async fn build_export(spec: &ExportConfig) -> Result<Arc<Export>, Error> {
    let backend: Arc<dyn BlockBackend> = match &spec.backing {
        Backing::File(path) => Arc::new(
            FileBackend::open(path, !spec.read_only)
                .await
                .map_err(ExportError::Backend)?,
        ),
        Backing::Memory(size) => Arc::new(MemBackend::new(*size)),
    };
    let export = Export::new(
        backend,
        ExportOptions {
            dev_offset: spec.dev_offset,
            size_bytes: spec.size_bytes,
            read_only: spec.read_only,
        },
    )
    .await?;
    Ok(export)
}
