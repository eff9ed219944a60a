//! Exports and the export registry.
//!
//! An export is a named slice of a backend volume offered to NBD clients.
//! The registry is the single list both the management plane and the
//! handshake consult: insertion-ordered, names unique while bound.

use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use wharf_nbd::{NBD_FLAG_READ_ONLY, NBD_MAX_NAME_SIZE};

use crate::backend::BlockBackend;
use crate::error::ExportError;
use crate::nbd::ClientConn;
use crate::types::round_down_to_sector;

/// Shape of an export within its backing volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Byte offset of the export within the volume. Sector-aligned.
    pub dev_offset: u64,
    /// Effective size; defaults to everything behind `dev_offset`. Rounded
    /// down to a whole number of sectors either way.
    pub size_bytes: Option<u64>,
    pub read_only: bool,
}

/// A block volume slice offered to clients.
///
/// Immutable after creation except for the name binding and the backend
/// handle. Clients hold a strong reference to their export; the export
/// keeps only weak handles back, so teardown order never deadlocks on a
/// reference cycle.
pub struct Export {
    backend: RwLock<Arc<dyn BlockBackend>>,
    dev_offset: u64,
    size: u64,
    flags: u16,
    name: Mutex<Option<String>>,
    clients: Mutex<Vec<Weak<ClientConn>>>,
}

impl Export {
    pub async fn new(
        backend: Arc<dyn BlockBackend>,
        opts: ExportOptions,
    ) -> Result<Arc<Self>, ExportError> {
        let backing_len = backend.length().await?;
        if opts.dev_offset > backing_len {
            return Err(ExportError::OffsetPastEnd {
                dev_offset: opts.dev_offset,
                backing_len,
            });
        }
        let available = backing_len - opts.dev_offset;
        let size = match opts.size_bytes {
            Some(requested) if requested > available => {
                return Err(ExportError::SizeTooLarge {
                    requested,
                    available,
                });
            }
            Some(requested) => requested,
            None => available,
        };
        let flags = if opts.read_only {
            NBD_FLAG_READ_ONLY
        } else {
            0
        };

        Ok(Arc::new(Self {
            backend: RwLock::new(backend),
            dev_offset: opts.dev_offset,
            size: round_down_to_sector(size),
            flags,
            name: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
        }))
    }

    /// Effective size in bytes; always a whole number of sectors.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn dev_offset(&self) -> u64 {
        self.dev_offset
    }

    /// Export-defined transmission flags (low 16 bits only).
    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn read_only(&self) -> bool {
        self.flags & NBD_FLAG_READ_ONLY != 0
    }

    /// Currently bound name, if any.
    pub fn name(&self) -> Option<String> {
        self.name.lock().unwrap().clone()
    }

    fn set_name(&self, name: Option<String>) {
        *self.name.lock().unwrap() = name;
    }

    /// The backend handle, behind the quiesce gate. Dispatch holds the
    /// returned guard across each backend call.
    pub(crate) async fn backend(&self) -> RwLockReadGuard<'_, Arc<dyn BlockBackend>> {
        self.backend.read().await
    }

    pub(crate) async fn try_alloc(&self, len: usize) -> Option<BytesMut> {
        self.backend.read().await.try_alloc(len)
    }

    /// Swap in a new backend volume. Takes the write side of the backend
    /// gate, so every in-flight backend call finishes first and no
    /// dispatch can observe the switch halfway.
    pub async fn replace_backend(&self, backend: Arc<dyn BlockBackend>) {
        let mut guard = self.backend.write().await;
        *guard = backend;
    }

    pub(crate) fn attach(&self, client: &Arc<ClientConn>) {
        self.clients.lock().unwrap().push(Arc::downgrade(client));
    }

    pub(crate) fn detach(&self, client_id: u64) {
        self.clients
            .lock()
            .unwrap()
            .retain(|weak| weak.upgrade().is_some_and(|c| c.id() != client_id));
    }

    /// Ask every attached client to shut down. Their connections drain on
    /// their own tasks; this does not wait for them.
    pub fn close_clients(&self) {
        let clients: Vec<Arc<ClientConn>> = self
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for client in clients {
            debug!(client = client.id(), "force-closing attached client");
            client.close();
        }
    }

    /// Number of currently attached clients.
    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }
}

/// Process-wide export list: insertion order preserved, bound names
/// unique. Handed to both the daemon's management plane and every
/// handshake so they always see the same bindings.
#[derive(Default)]
pub struct ExportRegistry {
    exports: Mutex<Vec<Arc<Export>>>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to an export, making it discoverable.
    pub fn bind(&self, export: Arc<Export>, name: &str) -> Result<(), ExportError> {
        if name.is_empty() {
            return Err(ExportError::EmptyName);
        }
        if name.len() > NBD_MAX_NAME_SIZE {
            return Err(ExportError::NameTooLong {
                length: name.len(),
                max: NBD_MAX_NAME_SIZE,
            });
        }
        let mut exports = self.exports.lock().unwrap();
        if exports.iter().any(|e| e.name().as_deref() == Some(name)) {
            return Err(ExportError::DuplicateName(name.to_string()));
        }
        export.set_name(Some(name.to_string()));
        exports.push(export);
        Ok(())
    }

    /// Look up a bound export by name.
    pub fn find(&self, name: &str) -> Option<Arc<Export>> {
        self.exports
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name().as_deref() == Some(name))
            .cloned()
    }

    /// Snapshot of all bound exports in insertion order.
    pub fn list(&self) -> Vec<Arc<Export>> {
        self.exports.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.exports.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.lock().unwrap().is_empty()
    }

    /// Unbind an export: force-close its clients and drop the name. The
    /// export itself lives on until the last client lets go of it.
    pub fn remove(&self, name: &str) -> Result<Arc<Export>, ExportError> {
        let export = {
            let mut exports = self.exports.lock().unwrap();
            let idx = exports
                .iter()
                .position(|e| e.name().as_deref() == Some(name))
                .ok_or_else(|| ExportError::NotFound(name.to_string()))?;
            exports.remove(idx)
        };
        export.close_clients();
        export.set_name(None);
        info!(name, "export unbound");
        Ok(export)
    }

    /// Tear down every export. Used at daemon shutdown.
    pub fn close_all(&self) {
        let exports: Vec<Arc<Export>> = self.exports.lock().unwrap().drain(..).collect();
        for export in exports {
            export.close_clients();
            export.set_name(None);
        }
    }
}
