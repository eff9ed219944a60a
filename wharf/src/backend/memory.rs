//! In-memory backend for tests, benchmarks, and throwaway devices.

use std::io;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::BlockBackend;
use crate::types::SECTOR_SIZE;

pub struct MemBackend {
    data: RwLock<Vec<u8>>,
}

impl MemBackend {
    /// A zero-filled volume of `size_bytes`.
    pub fn new(size_bytes: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size_bytes as usize]),
        }
    }
}

fn byte_range(sector: u64, len: usize, total: usize) -> io::Result<std::ops::Range<usize>> {
    let start = (sector as usize).checked_mul(SECTOR_SIZE);
    let end = start.and_then(|s| s.checked_add(len));
    match (start, end) {
        (Some(start), Some(end)) if end <= total => Ok(start..end),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "sector range past end of device",
        )),
    }
}

#[async_trait]
impl BlockBackend for MemBackend {
    async fn length(&self) -> io::Result<u64> {
        Ok(self.data.read().await.len() as u64)
    }

    async fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.read().await;
        let range = byte_range(sector, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    async fn write_sectors(&self, sector: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.write().await;
        let total = data.len();
        let range = byte_range(sector, buf.len(), total)?;
        data[range].copy_from_slice(buf);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    async fn discard(&self, sector: u64, nsectors: u64) -> io::Result<()> {
        let mut data = self.data.write().await;
        let total = data.len();
        let range = byte_range(sector, (nsectors as usize) * SECTOR_SIZE, total)?;
        data[range].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let backend = MemBackend::new(SECTOR_SIZE as u64 * 4);
        let pattern = vec![0x42u8; SECTOR_SIZE];
        backend.write_sectors(1, &pattern).await.unwrap();

        let mut buf = vec![0u8; SECTOR_SIZE];
        backend.read_sectors(1, &mut buf).await.unwrap();
        assert_eq!(buf, pattern);
    }

    #[tokio::test]
    async fn out_of_range_rejected() {
        let backend = MemBackend::new(SECTOR_SIZE as u64 * 2);
        let mut buf = vec![0u8; SECTOR_SIZE];
        assert!(backend.read_sectors(2, &mut buf).await.is_err());
        assert!(backend.write_sectors(2, &buf).await.is_err());
    }

    #[tokio::test]
    async fn discard_zeroes() {
        let backend = MemBackend::new(SECTOR_SIZE as u64 * 2);
        backend
            .write_sectors(0, &vec![0xFFu8; SECTOR_SIZE * 2])
            .await
            .unwrap();
        backend.discard(1, 1).await.unwrap();

        let mut buf = vec![0u8; SECTOR_SIZE * 2];
        backend.read_sectors(0, &mut buf).await.unwrap();
        assert!(buf[..SECTOR_SIZE].iter().all(|&b| b == 0xFF));
        assert!(buf[SECTOR_SIZE..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn length_reports_size() {
        let backend = MemBackend::new(4096);
        assert_eq!(backend.length().await.unwrap(), 4096);
    }
}
