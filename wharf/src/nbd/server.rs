//! Per-connection server driver.
//!
//! Glues the phases together for one connection: negotiate, attach the
//! client to its export, run the request pipeline, detach. Accepting
//! connections and spawning one of these per socket is `Daemon::listen`'s
//! job.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use wharf_nbd::NbdError;

use super::client_conn::ClientConn;
use super::{Limits, handshake, transmission};
use crate::export::{Export, ExportRegistry};

/// Serves single NBD connections against a shared export registry.
#[derive(Clone)]
pub struct NbdServer {
    registry: Arc<ExportRegistry>,
    limits: Limits,
}

impl NbdServer {
    pub fn new(registry: Arc<ExportRegistry>, limits: Limits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.registry
    }

    /// Serve one fixed-newstyle connection: negotiate an export, then run
    /// the transmission phase until the client goes away.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(export) = handshake::newstyle(&mut stream, &self.registry).await? else {
            // Clean abort during negotiation.
            return Ok(());
        };
        self.run_connection(stream, export).await
    }

    /// Serve one oldstyle connection against a preselected export; no
    /// option negotiation takes place.
    pub async fn serve_preselected<S>(
        &self,
        mut stream: S,
        export: Arc<Export>,
    ) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        handshake::oldstyle(&mut stream, &export).await?;
        self.run_connection(stream, export).await
    }

    async fn run_connection<S>(&self, stream: S, export: Arc<Export>) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client = ClientConn::new(Arc::clone(&export), self.limits);
        export.attach(&client);
        let name = export.name().unwrap_or_default();
        debug!(client = client.id(), export = %name, "client attached");

        let result = transmission::run(stream, Arc::clone(&client)).await;

        client.close();
        export.detach(client.id());
        debug!(client = client.id(), "client detached");
        result
    }
}
