//! Per-connection client state and lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::Limits;
use crate::export::Export;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// One NBD connection after negotiation.
///
/// Shared between the receive loop and every in-flight dispatch task; the
/// last `Arc` drops only after the connection has fully drained, so a
/// closed client cannot leak requests.
pub(crate) struct ClientConn {
    id: u64,
    pub(crate) export: Arc<Export>,
    limits: Limits,
    slots: Arc<Semaphore>,
    closing: AtomicBool,
    shutdown: Notify,
}

impl ClientConn {
    pub(crate) fn new(export: Arc<Export>, limits: Limits) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            export,
            limits,
            slots: Arc::new(Semaphore::new(limits.max_in_flight)),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Reserve an in-flight slot, suspending while the cap is reached.
    /// The permit is held from before the header read until the reply has
    /// been sent.
    pub(crate) async fn acquire_slot(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .expect("in-flight semaphore never closes")
    }

    /// Requests currently between header read and reply completion.
    pub(crate) fn in_flight(&self) -> usize {
        self.limits.max_in_flight - self.slots.available_permits()
    }

    /// Begin teardown. Idempotent; in-flight requests run to completion
    /// and release their slots before the connection state goes away.
    pub(crate) fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            debug!(client = self.id, "closing client");
            self.shutdown.notify_waiters();
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once `close` has been called, however many times it is
    /// awaited and in whatever order relative to `close`.
    pub(crate) async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closing() {
            return;
        }
        notified.await;
    }
}
