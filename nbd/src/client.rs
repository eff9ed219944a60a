//! Async NBD client.
//!
//! Speaks fixed newstyle with `NBD_OPT_EXPORT_NAME` negotiation and simple
//! replies, matching what the wharf server offers. One request is in
//! flight at a time; the handle is still checked on every reply.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// Bound on option-reply payloads so a misbehaving server cannot make the
/// client allocate without limit.
const OPTION_REPLY_MAX_BYTES: u32 = 64 * 1024;

/// A negotiated NBD connection in transmission phase.
pub struct NbdClient<S> {
    stream: S,
    handle_counter: AtomicU64,
    /// Size of the export in bytes.
    pub size_bytes: u64,
    /// Transmission flags advertised by the server.
    pub transmission_flags: u16,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Connect to a fixed-newstyle server and select `export_name`.
    pub async fn connect(mut stream: S, export_name: &str) -> Result<Self, NbdError> {
        read_greeting(&mut stream).await?;
        stream
            .write_all(&NBD_FLAG_C_FIXED_NEWSTYLE.to_be_bytes())
            .await?;

        let name = export_name.as_bytes();
        let header = OptionHeader {
            option: NBD_OPT_EXPORT_NAME,
            length: name.len() as u32,
        };
        stream.write_all(&header.to_bytes()).await?;
        stream.write_all(name).await?;

        // Export block: size, transmission flags, 124 reserved bytes.
        let mut block = [0u8; 134];
        stream.read_exact(&mut block).await?;
        let size_bytes = u64::from_be_bytes(block[0..8].try_into().unwrap());
        let transmission_flags = u16::from_be_bytes(block[8..10].try_into().unwrap());

        Ok(Self {
            stream,
            handle_counter: AtomicU64::new(1),
            size_bytes,
            transmission_flags,
        })
    }

    /// Enumerate export names via `NBD_OPT_LIST`, then abort the
    /// negotiation. Consumes the stream; the server closes its end.
    pub async fn list(mut stream: S) -> Result<Vec<String>, NbdError> {
        read_greeting(&mut stream).await?;
        stream
            .write_all(&NBD_FLAG_C_FIXED_NEWSTYLE.to_be_bytes())
            .await?;

        let header = OptionHeader {
            option: NBD_OPT_LIST,
            length: 0,
        };
        stream.write_all(&header.to_bytes()).await?;

        let mut names = Vec::new();
        loop {
            let mut buf = [0u8; OptionReply::SIZE_BYTES];
            stream.read_exact(&mut buf).await?;
            let reply = OptionReply::from_bytes(&buf)?;
            if reply.length > OPTION_REPLY_MAX_BYTES {
                return Err(NbdError::FrameTooLarge {
                    length_bytes: reply.length,
                    max_bytes: OPTION_REPLY_MAX_BYTES,
                });
            }
            let mut data = vec![0u8; reply.length as usize];
            stream.read_exact(&mut data).await?;

            match reply.reply_type {
                NBD_REP_SERVER => {
                    if data.len() < 4 {
                        return Err(NbdError::NegotiationFailed {
                            reason: "short LIST reply",
                        });
                    }
                    let name_len = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
                    if data.len() < 4 + name_len {
                        return Err(NbdError::NegotiationFailed {
                            reason: "truncated export name in LIST reply",
                        });
                    }
                    names.push(String::from_utf8_lossy(&data[4..4 + name_len]).into_owned());
                }
                NBD_REP_ACK => break,
                code if code & NBD_REP_FLAG_ERROR != 0 => {
                    return Err(NbdError::ServerError { code });
                }
                _ => {
                    return Err(NbdError::NegotiationFailed {
                        reason: "unexpected LIST reply type",
                    });
                }
            }
        }

        let abort = OptionHeader {
            option: NBD_OPT_ABORT,
            length: 0,
        };
        stream.write_all(&abort.to_bytes()).await?;
        Ok(names)
    }

    fn next_handle(&self) -> u64 {
        self.handle_counter.fetch_add(1, Ordering::Relaxed)
    }

    async fn roundtrip(&mut self, request: Request) -> Result<(), NbdError> {
        self.stream.write_all(&request.to_bytes()).await?;
        self.read_reply(request.handle).await
    }

    async fn read_reply(&mut self, handle: u64) -> Result<(), NbdError> {
        let mut buf = [0u8; Reply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        let reply = Reply::from_bytes(&buf)?;
        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }
        if reply.error != NBD_SUCCESS {
            return Err(NbdError::ServerError { code: reply.error });
        }
        Ok(())
    }

    /// Read `length` bytes at `offset`.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let request = Request::new(Command::Read, self.next_handle(), offset, length);
        self.roundtrip(request).await?;
        let mut data = BytesMut::zeroed(length as usize);
        self.stream.read_exact(&mut data).await?;
        Ok(data.freeze())
    }

    /// Write `data` at `offset`.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let request = Request::new(Command::Write, self.next_handle(), offset, data.len() as u32);
        self.stream.write_all(&request.to_bytes()).await?;
        self.stream.write_all(data).await?;
        self.read_reply(request.handle).await
    }

    /// Write `data` at `offset` with Force Unit Access semantics.
    pub async fn write_fua(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let request =
            Request::new(Command::Write, self.next_handle(), offset, data.len() as u32).with_fua();
        self.stream.write_all(&request.to_bytes()).await?;
        self.stream.write_all(data).await?;
        self.read_reply(request.handle).await
    }

    /// Commit all completed writes to stable storage.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        let request = Request::new(Command::Flush, self.next_handle(), 0, 0);
        self.roundtrip(request).await
    }

    /// Hint that a byte range is no longer needed. The server may or may
    /// not discard it; the range reads back as unspecified data.
    pub async fn trim(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        let request = Request::new(Command::Trim, self.next_handle(), offset, length);
        self.roundtrip(request).await
    }

    /// Send `NBD_CMD_DISC` and drop the connection. No reply is expected.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        let request = Request::new(Command::Disconnect, self.next_handle(), 0, 0);
        self.stream.write_all(&request.to_bytes()).await?;
        Ok(())
    }
}

async fn read_greeting<S>(stream: &mut S) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 18];
    stream.read_exact(&mut greeting).await?;

    if &greeting[0..8] != NBD_PASSWD {
        return Err(NbdError::NegotiationFailed {
            reason: "bad passwd in greeting",
        });
    }
    let magic = u64::from_be_bytes(greeting[8..16].try_into().unwrap());
    if magic != NBD_OPTS_MAGIC {
        return Err(NbdError::InvalidMagic {
            expected: NBD_OPTS_MAGIC,
            actual: magic,
        });
    }
    let flags = u16::from_be_bytes(greeting[16..18].try_into().unwrap());
    if flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(NbdError::NegotiationFailed {
            reason: "server does not speak fixed newstyle",
        });
    }
    Ok(())
}
