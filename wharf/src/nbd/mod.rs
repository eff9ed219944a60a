//! NBD server: handshake engine, request pipeline, and connection
//! lifecycle.
//!
//! # Architecture
//!
//! - [`NbdServer`] drives a single connection: negotiation via the
//!   handshake engine, then the transmission phase.
//! - [`Listener`] abstracts over connection sources (TCP, Unix sockets,
//!   in-memory channels); `Daemon::listen` accepts from any of them.
//! - [`Limits`] carries the per-connection policy knobs.

mod client_conn;
mod handshake;
mod listener;
mod server;
mod transmission;

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) use client_conn::ClientConn;
pub use listener::{ChannelListener, Listener};
pub use server::NbdServer;

/// Per-connection policy.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Requests allowed between header read and reply completion at once.
    pub max_in_flight: usize,
    /// Largest READ/WRITE payload accepted; larger requests get a framed
    /// error.
    pub max_request_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            max_request_bytes: wharf_nbd::NBD_MAX_BUFFER_SIZE as usize,
        }
    }
}

/// Read and discard `len` bytes, keeping the stream framed when a payload
/// is refused.
pub(crate) async fn drain<R>(reader: &mut R, mut len: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 4096];
    while len > 0 {
        let chunk = scratch.len().min(len);
        let n = reader.read(&mut scratch[..chunk]).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        len -= n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drain_discards_exactly() {
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&[0xAAu8; 10_000]).await.unwrap();
        tx.write_all(b"tail").await.unwrap();

        drain(&mut rx, 10_000).await.unwrap();
        let mut tail = [0u8; 4];
        rx.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[tokio::test]
    async fn drain_reports_truncation() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&[0u8; 100]).await.unwrap();
        drop(tx);
        let err = drain(&mut rx, 200).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
