//! Block backend interface.
//!
//! A backend is the storage a device is carved out of: a raw image file,
//! a memory buffer, or anything else that can do sector-aligned I/O. The
//! server core only talks to this trait; errors cross it as `io::Error`
//! and are translated to NBD error codes at the reply boundary.

mod file;
mod memory;

use std::io;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::types::SECTOR_SIZE;

pub use file::FileBackend;
pub use memory::MemBackend;

/// An open block volume.
///
/// `sector` arguments address 512-byte sectors; data buffers are always a
/// whole number of sectors long and at least `alignment()`-aligned.
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Size of the volume in bytes.
    async fn length(&self) -> io::Result<u64>;

    /// Fill `buf` from the volume starting at `sector`.
    async fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` to the volume starting at `sector`.
    async fn write_sectors(&self, sector: u64, buf: &[u8]) -> io::Result<()>;

    /// Commit completed writes to stable storage.
    async fn flush(&self) -> io::Result<()>;

    /// Drop `nsectors` starting at `sector`. Best effort: success does not
    /// imply the range reads back as zeroes.
    async fn discard(&self, sector: u64, nsectors: u64) -> io::Result<()>;

    /// Required alignment for I/O buffers.
    fn alignment(&self) -> usize {
        SECTOR_SIZE
    }

    /// Allocate a zeroed I/O buffer of `len` bytes, or `None` if the
    /// backend cannot provide one right now. Callers treat `None` as a
    /// recoverable out-of-memory condition, not a failure of the volume.
    fn try_alloc(&self, len: usize) -> Option<BytesMut> {
        Some(BytesMut::zeroed(len))
    }
}
