//! Raw image file backend.
//!
//! Positional reads and writes against a regular file, run on the
//! blocking pool so a slow disk never stalls the runtime.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;

use super::BlockBackend;
use crate::types::SECTOR_SIZE;

pub struct FileBackend {
    file: Arc<File>,
    writable: bool,
}

impl FileBackend {
    /// Open an image file. A read-only open still serves reads; writes
    /// fail at the OS level and surface as framed errors.
    pub async fn open(path: impl AsRef<Path>, writable: bool) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .await?
            .into_std()
            .await;
        Ok(Self {
            file: Arc::new(file),
            writable,
        })
    }

    async fn run_blocking<T, F>(&self, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| io::Error::other(format!("blocking task join error: {e}")))?
    }
}

#[async_trait]
impl BlockBackend for FileBackend {
    async fn length(&self) -> io::Result<u64> {
        self.run_blocking(|file| Ok(file.metadata()?.len())).await
    }

    async fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        let offset = sector * SECTOR_SIZE as u64;
        let len = buf.len();
        let data = self
            .run_blocking(move |file| {
                let mut data = vec![0u8; len];
                file.read_exact_at(&mut data, offset)?;
                Ok(data)
            })
            .await?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    async fn write_sectors(&self, sector: u64, buf: &[u8]) -> io::Result<()> {
        let offset = sector * SECTOR_SIZE as u64;
        let data = buf.to_vec();
        self.run_blocking(move |file| file.write_all_at(&data, offset))
            .await
    }

    async fn flush(&self) -> io::Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.run_blocking(|file| file.sync_data()).await
    }

    #[cfg(target_os = "linux")]
    async fn discard(&self, sector: u64, nsectors: u64) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        if !self.writable || nsectors == 0 {
            return Ok(());
        }
        let offset = (sector * SECTOR_SIZE as u64) as libc::off_t;
        let len = (nsectors * SECTOR_SIZE as u64) as libc::off_t;
        self.run_blocking(move |file| {
            let rc = unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset,
                    len,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                // Not every filesystem can punch holes; discard is advisory.
                if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
                    return Ok(());
                }
                return Err(err);
            }
            Ok(())
        })
        .await
    }

    #[cfg(not(target_os = "linux"))]
    async fn discard(&self, _sector: u64, _nsectors: u64) -> io::Result<()> {
        Ok(())
    }
}
