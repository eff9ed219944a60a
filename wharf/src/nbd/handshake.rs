//! Handshake engine: oldstyle and fixed-newstyle negotiation.
//!
//! A connection with a preselected export gets the oldstyle block and
//! moves straight to transmission. Everything else is fixed newstyle:
//! greeting, client flags, then an option loop until the client selects
//! an export or goes away.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use wharf_nbd::{
    NBD_FLAG_C_FIXED_NEWSTYLE, NBD_FLAG_HAS_FLAGS, NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_FUA,
    NBD_FLAG_SEND_TRIM, NBD_MAX_NAME_SIZE, NBD_OPT_ABORT, NBD_OPT_EXPORT_NAME, NBD_OPT_LIST,
    NBD_REP_ACK, NBD_REP_ERR_INVALID, NBD_REP_ERR_UNSUP, NBD_REP_SERVER, NbdError, OptionHeader,
    OptionReply, export_block, newstyle_greeting, oldstyle_header,
};

use super::drain;
use crate::export::{Export, ExportRegistry};

/// Flags the server always advertises on top of an export's own set.
const SERVER_FLAGS: u16 =
    NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_FUA | NBD_FLAG_SEND_TRIM;

/// Largest option payload entertained before the client is considered
/// hostile.
const OPTION_DATA_MAX_BYTES: u32 = 64 * 1024;

pub(crate) fn transmission_flags(export: &Export) -> u16 {
    SERVER_FLAGS | export.flags()
}

/// Oldstyle negotiation for a preselected export: emit the 152-byte block
/// and the connection is ready for transmission.
pub(crate) async fn oldstyle<S>(stream: &mut S, export: &Export) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&oldstyle_header(export.size(), transmission_flags(export)))
        .await?;
    Ok(())
}

/// Fixed-newstyle negotiation. Returns the export the client selected, or
/// `None` when the client aborted cleanly.
pub(crate) async fn newstyle<S>(
    stream: &mut S,
    registry: &ExportRegistry,
) -> Result<Option<Arc<Export>>, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&newstyle_greeting()).await?;

    let mut flags = [0u8; 4];
    stream.read_exact(&mut flags).await?;
    let client_flags = u32::from_be_bytes(flags);
    if client_flags != 0 && client_flags != NBD_FLAG_C_FIXED_NEWSTYLE {
        warn!(client_flags, "unacceptable client flags");
        return Err(NbdError::NegotiationFailed {
            reason: "bad client flags",
        });
    }

    loop {
        let mut buf = [0u8; OptionHeader::SIZE_BYTES];
        stream.read_exact(&mut buf).await?;
        let header = OptionHeader::from_bytes(&buf)?;
        debug!(option = header.option, length = header.length, "client option");

        if header.length > OPTION_DATA_MAX_BYTES {
            return Err(NbdError::FrameTooLarge {
                length_bytes: header.length,
                max_bytes: OPTION_DATA_MAX_BYTES,
            });
        }

        match header.option {
            NBD_OPT_LIST => handle_list(stream, registry, header.length).await?,
            NBD_OPT_ABORT => {
                debug!("client aborted negotiation");
                return Ok(None);
            }
            NBD_OPT_EXPORT_NAME => {
                let export = handle_export_name(stream, registry, header.length).await?;
                stream
                    .write_all(&export_block(export.size(), transmission_flags(&export)))
                    .await?;
                return Ok(Some(export));
            }
            option => {
                // Consume the payload so the error reply stays framed,
                // tell the client, then give up on the connection.
                drain(stream, header.length as usize).await?;
                send_option_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                warn!(option, "unsupported option");
                return Err(NbdError::NegotiationFailed {
                    reason: "unsupported option",
                });
            }
        }
    }
}

/// `NBD_OPT_LIST` carries no payload; a client that sends one gets
/// `ERR_INVALID` and may try again. Exports are announced in binding
/// order, one `REP_SERVER` each, then an ack.
async fn handle_list<S>(
    stream: &mut S,
    registry: &ExportRegistry,
    length: u32,
) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if length != 0 {
        drain(stream, length as usize).await?;
        return send_option_reply(stream, NBD_OPT_LIST, NBD_REP_ERR_INVALID, &[]).await;
    }

    for export in registry.list() {
        let Some(name) = export.name() else {
            continue;
        };
        let mut data = Vec::with_capacity(4 + name.len());
        data.extend_from_slice(&(name.len() as u32).to_be_bytes());
        data.extend_from_slice(name.as_bytes());
        send_option_reply(stream, NBD_OPT_LIST, NBD_REP_SERVER, &data).await?;
    }
    send_option_reply(stream, NBD_OPT_LIST, NBD_REP_ACK, &[]).await
}

async fn handle_export_name<S>(
    stream: &mut S,
    registry: &ExportRegistry,
    length: u32,
) -> Result<Arc<Export>, NbdError>
where
    S: AsyncRead + Unpin,
{
    if length as usize > NBD_MAX_NAME_SIZE {
        warn!(length, "export name over the wire limit");
        return Err(NbdError::NegotiationFailed {
            reason: "export name too long",
        });
    }
    let mut name = vec![0u8; length as usize];
    stream.read_exact(&mut name).await?;
    let name = String::from_utf8(name).map_err(|_| NbdError::NegotiationFailed {
        reason: "export name is not UTF-8",
    })?;

    match registry.find(&name) {
        Some(export) => Ok(export),
        None => {
            warn!(name = %name, "export not found");
            Err(NbdError::UnknownExport { name })
        }
    }
}

async fn send_option_reply<S>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let header = OptionReply {
        option,
        reply_type,
        length: data.len() as u32,
    };
    stream.write_all(&header.to_bytes()).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}
