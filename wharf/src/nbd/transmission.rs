//! Transmission phase: the per-connection request pipeline.
//!
//! One receive loop per connection pulls request headers off the socket,
//! gated by the in-flight cap. Each decoded request runs on its own
//! dispatch task, so slow backend I/O overlaps across requests and
//! replies may leave in any order; the send lock keeps every reply's
//! header and payload contiguous on the wire.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use wharf_nbd::{
    Command, NBD_EINVAL, NBD_ENOMEM, NBD_EPERM, NBD_SUCCESS, NbdError, Reply, Request,
    io_error_to_nbd,
};

use super::client_conn::ClientConn;
use super::drain;
use crate::export::Export;
use crate::types::SECTOR_SIZE;

/// Run the transmission phase until the client disconnects, the stream
/// fails, or the client is closed from the management side.
pub(crate) async fn run<S>(stream: S, client: Arc<ClientConn>) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let mut tasks = JoinSet::new();

    let result = receive_loop(&mut reader, &writer, &client, &mut tasks).await;

    // In-flight requests finish and send what they can before the
    // connection state is torn down; none of them outlives the loop.
    client.close();
    while tasks.join_next().await.is_some() {}
    result
}

async fn receive_loop<S>(
    reader: &mut ReadHalf<S>,
    writer: &Arc<Mutex<WriteHalf<S>>>,
    client: &Arc<ClientConn>,
    tasks: &mut JoinSet<()>,
) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        // A free in-flight slot gates the next header read. At the cap the
        // loop parks here and the socket goes unread until a reply
        // completes.
        let permit = tokio::select! {
            permit = client.acquire_slot() => permit,
            _ = client.closed() => return Ok(()),
        };

        let mut header = [0u8; Request::SIZE_BYTES];
        tokio::select! {
            res = reader.read_exact(&mut header) => match res {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            },
            _ = client.closed() => return Ok(()),
        }

        let request = Request::from_bytes(&header)?;
        let command = Command::from_u16(request.command());

        if request.offset.checked_add(u64::from(request.length)).is_none() {
            warn!(
                offset = request.offset,
                length = request.length,
                "offset + length overflows, dropping client"
            );
            return Err(NbdError::OffsetOverflow {
                offset: request.offset,
                length: request.length,
            });
        }

        if command == Some(Command::Disconnect) {
            debug!(handle = request.handle, "client disconnect");
            return Ok(());
        }

        // Land the payload (WRITE) or reserve the reply buffer (READ)
        // before dispatch. Refusals are framed errors, not connection
        // errors, so a WRITE payload is consumed either way.
        let mut data = None;
        if matches!(command, Some(Command::Read | Command::Write)) {
            let len = request.length as usize;
            if len > client.limits().max_request_bytes {
                warn!(
                    length = len,
                    max = client.limits().max_request_bytes,
                    "request length over limit"
                );
                if command == Some(Command::Write) {
                    drain(reader, len).await?;
                }
                send_reply(writer, Reply::error(request.handle, NBD_EINVAL), None).await?;
                continue;
            }
            match client.export.try_alloc(len).await {
                Some(mut buf) => {
                    if command == Some(Command::Write) {
                        reader.read_exact(&mut buf[..]).await.map_err(NbdError::from)?;
                    }
                    data = Some(buf);
                }
                None => {
                    warn!(length = len, "request buffer allocation failed");
                    if command == Some(Command::Write) {
                        drain(reader, len).await?;
                    }
                    send_reply(writer, Reply::error(request.handle, NBD_ENOMEM), None).await?;
                    continue;
                }
            }
        }

        let client = Arc::clone(client);
        let writer = Arc::clone(writer);
        tasks.spawn(async move {
            dispatch(client, writer, request, command, data, permit).await;
        });
    }
}

async fn dispatch<S>(
    client: Arc<ClientConn>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    request: Request,
    command: Option<Command>,
    mut data: Option<BytesMut>,
    permit: OwnedSemaphorePermit,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let export = &client.export;

    // offset + length cannot overflow; the receive loop dropped the
    // connection if it did.
    let error = if request.offset + u64::from(request.length) > export.size() {
        warn!(
            offset = request.offset,
            length = request.length,
            size = export.size(),
            "request past end of export"
        );
        NBD_EINVAL
    } else {
        match execute(export, &request, command, data.as_mut()).await {
            Ok(()) => NBD_SUCCESS,
            Err(code) => code,
        }
    };

    let payload = match (command, error) {
        (Some(Command::Read), NBD_SUCCESS) => data.map(BytesMut::freeze),
        _ => None,
    };

    let sent = send_reply(
        &writer,
        Reply {
            error,
            handle: request.handle,
        },
        payload.as_deref(),
    )
    .await;
    drop(permit);

    if let Err(e) = sent {
        warn!(error = %e, "reply write failed, dropping client");
        client.close();
    }
}

/// Run one command against the export's backend, returning the NBD error
/// code for the reply. Backend errors never tear the connection down.
async fn execute(
    export: &Export,
    request: &Request,
    command: Option<Command>,
    data: Option<&mut BytesMut>,
) -> Result<(), u32> {
    let Some(command) = command else {
        warn!(command = request.command(), "unknown request type");
        return Err(NBD_EINVAL);
    };

    // Held across the backend call so a backend swap waits for us.
    let backend = export.backend().await;
    let sector = (request.offset + export.dev_offset()) / SECTOR_SIZE as u64;
    let nsectors = u64::from(request.length) / SECTOR_SIZE as u64;

    match command {
        Command::Read => {
            let Some(buf) = data else {
                return Err(NBD_EINVAL);
            };
            if request.is_fua() {
                backend
                    .flush()
                    .await
                    .map_err(|e| backend_error("flush", &e))?;
            }
            if !buf.is_empty() {
                backend
                    .read_sectors(sector, &mut buf[..])
                    .await
                    .map_err(|e| backend_error("read", &e))?;
            }
            Ok(())
        }
        Command::Write => {
            if export.read_only() {
                debug!(handle = request.handle, "write to read-only export");
                return Err(NBD_EPERM);
            }
            let Some(buf) = data else {
                return Err(NBD_EINVAL);
            };
            if !buf.is_empty() {
                backend
                    .write_sectors(sector, &buf[..])
                    .await
                    .map_err(|e| backend_error("write", &e))?;
            }
            if request.is_fua() {
                backend
                    .flush()
                    .await
                    .map_err(|e| backend_error("flush", &e))?;
            }
            Ok(())
        }
        Command::Flush => backend
            .flush()
            .await
            .map_err(|e| backend_error("flush", &e)),
        Command::Trim => backend
            .discard(sector, nsectors)
            .await
            .map_err(|e| backend_error("discard", &e)),
        // The receive loop never dispatches a disconnect.
        Command::Disconnect => Err(NBD_EINVAL),
    }
}

fn backend_error(op: &'static str, err: &io::Error) -> u32 {
    warn!(op, error = %err, "backend operation failed");
    io_error_to_nbd(err)
}

/// One lock acquisition covers header and payload, so the two hit the
/// wire back to back with nothing from another reply in between.
async fn send_reply<S>(
    writer: &Mutex<WriteHalf<S>>,
    reply: Reply,
    payload: Option<&[u8]>,
) -> Result<(), NbdError>
where
    S: AsyncWrite,
{
    let mut writer = writer.lock().await;
    writer.write_all(&reply.to_bytes()).await?;
    if let Some(payload) = payload {
        writer.write_all(payload).await?;
    }
    Ok(())
}
