//! Connection sources for the daemon.
//!
//! The accept loop does not care where sockets come from: TCP in
//! production, Unix sockets for local setups, or an in-memory channel
//! when tests and benchmarks drive the daemon over duplex pipes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Anything that can hand the daemon connected streams.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next incoming connection.
    async fn accept(&mut self) -> std::io::Result<Self::Stream>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        TcpListener::accept(self).await.map(|(stream, _addr)| stream)
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        UnixListener::accept(self).await.map(|(stream, _addr)| stream)
    }
}

/// A listener fed through an mpsc channel.
///
/// `accept` yields streams in the order they were sent; once every sender
/// is gone it reports `BrokenPipe`, which the accept loop treats as a
/// normal end of service.
pub struct ChannelListener<S> {
    rx: mpsc::Receiver<S>,
}

impl<S> ChannelListener<S> {
    /// Returns the sender half for pushing streams plus the listener.
    pub fn new(capacity: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl<S> Listener for ChannelListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        self.rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "all senders dropped")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn yields_streams_in_order() {
        let (tx, mut listener) = ChannelListener::new(2);

        let (a, _keep_a) = duplex(64);
        let (b, _keep_b) = duplex(64);
        tx.send(a).await.unwrap();
        tx.send(b).await.unwrap();

        listener.accept().await.unwrap();
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn reports_broken_pipe_when_senders_gone() {
        let (tx, mut listener) = ChannelListener::<tokio::io::DuplexStream>::new(1);
        drop(tx);

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
