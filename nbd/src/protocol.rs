//! NBD protocol wire format: magic numbers, flags, and the fixed-size
//! handshake, request, and reply frames.
//!
//! Everything on the wire is network byte order. See
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

use std::io;

use thiserror::Error;

// Magic values
pub const NBD_PASSWD: &[u8; 8] = b"NBDMAGIC";
pub const NBD_CLIENT_MAGIC: u64 = 0x00420281861253;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

// Handshake flags (server -> client, 16 bits)
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;

// Client flags (client -> server, 32 bits)
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;

// Transmission flags (per export, 16 bits)
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

// Options
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;

// Option reply types
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = 1 | NBD_REP_FLAG_ERROR;
pub const NBD_REP_ERR_INVALID: u32 = 3 | NBD_REP_FLAG_ERROR;

// Commands (low 16 bits of the request type field)
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;

/// Mask selecting the command out of the request type field.
pub const NBD_CMD_MASK_COMMAND: u32 = 0xffff;
/// Force Unit Access: do not complete before the data is durable.
pub const NBD_CMD_FLAG_FUA: u32 = 1 << 16;

// NBD error codes carried in reply frames
pub const NBD_SUCCESS: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;

/// Upper bound on a single READ/WRITE payload.
///
/// Portable clients expect servers to accept at least 32 MiB; anything
/// larger is refused with a framed `NBD_EINVAL` rather than allocated.
pub const NBD_MAX_BUFFER_SIZE: u32 = 32 * 1024 * 1024;

/// Longest export name accepted during negotiation.
pub const NBD_MAX_NAME_SIZE: usize = 255;

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:x}, got 0x{actual:x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("negotiation failed: {reason}")]
    NegotiationFailed { reason: &'static str },

    #[error("unknown export: {name}")]
    UnknownExport { name: String },

    #[error("offset {offset} + length {length} overflows")]
    OffsetOverflow { offset: u64, length: u32 },

    #[error("frame too large: {length_bytes} bytes (max {max_bytes})")]
    FrameTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("server returned NBD error {code}")]
    ServerError { code: u32 },

    #[error("handle mismatch: expected {expected:#x}, got {actual:#x}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Map a host I/O error onto the NBD error code carried in a reply.
///
/// Unknown errors degrade to `NBD_EINVAL`; the connection is never torn
/// down because a backend call failed.
pub fn io_error_to_nbd(err: &io::Error) -> u32 {
    if let Some(errno) = err.raw_os_error() {
        return match errno {
            0 => NBD_SUCCESS,
            libc::EPERM => NBD_EPERM,
            libc::EIO => NBD_EIO,
            libc::ENOMEM => NBD_ENOMEM,
            libc::ENOSPC | libc::EFBIG | libc::EDQUOT => NBD_ENOSPC,
            _ => NBD_EINVAL,
        };
    }
    // Synthetic errors (no errno) from in-process backends.
    match err.kind() {
        io::ErrorKind::PermissionDenied => NBD_EPERM,
        io::ErrorKind::OutOfMemory => NBD_ENOMEM,
        io::ErrorKind::StorageFull | io::ErrorKind::FileTooLarge | io::ErrorKind::QuotaExceeded => {
            NBD_ENOSPC
        }
        io::ErrorKind::InvalidInput => NBD_EINVAL,
        _ => NBD_EIO,
    }
}

/// Transmission-phase request header (28 bytes on the wire).
///
/// The type field packs the command into its low 16 bits; the upper bits
/// carry command flags such as FUA.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub ty: u32,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

/// Commands a request header can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
}

impl Command {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISC => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISC,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
        }
    }
}

impl Request {
    pub const SIZE_BYTES: usize = 28;

    pub fn new(command: Command, handle: u64, offset: u64, length: u32) -> Self {
        Self {
            ty: u32::from(command.to_u16()),
            handle,
            offset,
            length,
        }
    }

    /// The command bits of the type field. May not name a known command;
    /// dispatch decides what an unknown value means.
    pub fn command(&self) -> u16 {
        (self.ty & NBD_CMD_MASK_COMMAND) as u16
    }

    pub fn is_fua(&self) -> bool {
        self.ty & NBD_CMD_FLAG_FUA != 0
    }

    pub fn with_fua(mut self) -> Self {
        self.ty |= NBD_CMD_FLAG_FUA;
        self
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.ty.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode a request header, validating only the magic. Command and
    /// length policy are checked by the caller so that a malformed request
    /// can still be answered with a framed error.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: u64::from(NBD_REQUEST_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            ty: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            handle: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            length: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// Simple reply header (16 bytes on the wire). A READ reply is followed by
/// its payload; everything else is the bare header.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub error: u32,
    pub handle: u64,
}

impl Reply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_SUCCESS,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != NBD_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: u64::from(NBD_REPLY_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            error: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            handle: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// Newstyle option header, client to server (16 bytes on the wire),
/// followed by `length` bytes of option data.
#[derive(Debug, Clone, Copy)]
pub struct OptionHeader {
    pub option: u32,
    pub length: u32,
}

impl OptionHeader {
    pub const SIZE_BYTES: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_OPTS_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTS_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            option: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            length: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// Newstyle option reply header, server to client (20 bytes on the wire),
/// followed by `length` bytes of reply data.
#[derive(Debug, Clone, Copy)]
pub struct OptionReply {
    pub option: u32,
    pub reply_type: u32,
    pub length: u32,
}

impl OptionReply {
    pub const SIZE_BYTES: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_REP_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reply_type.to_be_bytes());
        buf[16..20].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_REP_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REP_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            option: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            reply_type: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            length: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// The complete oldstyle negotiation block (152 bytes): passwd, client
/// magic, export size, a zero server-flags word, the 16-bit export flags,
/// and 124 reserved zero bytes.
pub fn oldstyle_header(size: u64, flags: u16) -> [u8; 152] {
    let mut buf = [0u8; 152];
    buf[0..8].copy_from_slice(NBD_PASSWD);
    buf[8..16].copy_from_slice(&NBD_CLIENT_MAGIC.to_be_bytes());
    buf[16..24].copy_from_slice(&size.to_be_bytes());
    // buf[24..26] stays zero (server flags)
    buf[26..28].copy_from_slice(&flags.to_be_bytes());
    buf
}

/// The fixed-newstyle greeting (18 bytes): passwd, option magic, and the
/// 16-bit handshake flags.
pub fn newstyle_greeting() -> [u8; 18] {
    let mut buf = [0u8; 18];
    buf[0..8].copy_from_slice(NBD_PASSWD);
    buf[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    buf[16..18].copy_from_slice(&NBD_FLAG_FIXED_NEWSTYLE.to_be_bytes());
    buf
}

/// The post-negotiation export block (134 bytes): size, transmission
/// flags, and 124 reserved zero bytes.
pub fn export_block(size: u64, flags: u16) -> [u8; 134] {
    let mut buf = [0u8; 134];
    buf[0..8].copy_from_slice(&size.to_be_bytes());
    buf[8..10].copy_from_slice(&flags.to_be_bytes());
    buf
}

const _: () = {
    assert!(Request::SIZE_BYTES == 28);
    assert!(Reply::SIZE_BYTES == 16);
    assert!(OptionHeader::SIZE_BYTES == 16);
    assert!(OptionReply::SIZE_BYTES == 20);
};
