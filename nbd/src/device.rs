//! Linux kernel NBD device support.
//!
//! Attaches a `/dev/nbd*` device to a remote server via the kernel ioctl
//! interface, replacing the `nbd-client` binary for simple setups.

use std::fs::OpenOptions;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::thread::JoinHandle;

use crate::NbdClient;
use crate::protocol::*;

// NBD ioctl numbers from linux/nbd.h (architecture-independent).
#[allow(dead_code)]
mod ioctl {
    pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    pub const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
    pub const NBD_SET_SIZE: libc::c_ulong = 0xab02;
    pub const NBD_DO_IT: libc::c_ulong = 0xab03;
    pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    pub const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
    pub const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
    pub const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    pub const NBD_SET_TIMEOUT: libc::c_ulong = 0xab09;
    pub const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;
}
use ioctl::*;

const DEVICE_BLOCK_SIZE: u64 = 512;

/// Sever an NBD device from its server: clear the request queue, ask the
/// kernel to send `NBD_CMD_DISC`, then drop the socket.
///
/// Errors from the individual ioctls are ignored; the device may already
/// be half torn down when this runs.
#[cfg(target_os = "linux")]
pub fn disconnect(fd: RawFd) -> io::Result<()> {
    unsafe {
        libc::ioctl(fd, NBD_CLEAR_QUE);
        libc::ioctl(fd, NBD_DISCONNECT);
        libc::ioctl(fd, NBD_CLEAR_SOCK);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn disconnect(_fd: RawFd) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "kernel NBD devices are Linux-only",
    ))
}

/// A connected kernel NBD device. Disconnected on drop.
pub struct NbdDevice {
    device_path: String,
    /// Kept open so the fd stays valid for the DO_IT thread.
    _device_fd: OwnedFd,
    do_it_handle: Option<JoinHandle<io::Result<()>>>,
    _socket: TcpStream,
}

impl NbdDevice {
    /// Connect an NBD device to a server: TCP connect, protocol handshake,
    /// configure the device via ioctls, then run `NBD_DO_IT` on a
    /// background thread until disconnect.
    pub async fn connect(
        device_path: &str,
        host: &str,
        port: u16,
        export_name: &str,
    ) -> Result<Self, NbdError> {
        let device_path = device_path.to_string();
        let host = host.to_string();
        let export_name = export_name.to_string();

        tokio::task::spawn_blocking(move || {
            Self::connect_sync(&device_path, &host, port, &export_name)
        })
        .await
        .map_err(|e| NbdError::Io(io::Error::other(format!("task join error: {e}"))))?
    }

    fn connect_sync(
        device_path: &str,
        host: &str,
        port: u16,
        export_name: &str,
    ) -> Result<Self, NbdError> {
        let addr = format!("{host}:{port}");
        let socket = TcpStream::connect(&addr)?;
        socket.set_nodelay(true)?;

        // The handshake client is async; drive it on a throwaway
        // current-thread runtime against a clone of the socket.
        let handshake_socket = socket.try_clone()?;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(|e| NbdError::Io(io::Error::other(format!("runtime error: {e}"))))?;
        let size_bytes = rt.block_on(async {
            let async_socket = tokio::net::TcpStream::from_std(handshake_socket)?;
            let client = NbdClient::connect(async_socket, export_name).await?;
            Ok::<_, NbdError>(client.size_bytes)
        })?;

        let device_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Path::new(device_path))?;
        let device_fd = device_file.as_raw_fd();
        let socket_fd = socket.as_raw_fd();

        unsafe {
            // Clear any state a previous user left behind; failure is fine.
            libc::ioctl(device_fd, NBD_CLEAR_SOCK);

            if libc::ioctl(device_fd, NBD_SET_BLKSIZE, DEVICE_BLOCK_SIZE) < 0 {
                return Err(NbdError::Io(io::Error::last_os_error()));
            }
            if libc::ioctl(device_fd, NBD_SET_SIZE, size_bytes) < 0 {
                return Err(NbdError::Io(io::Error::last_os_error()));
            }
            if libc::ioctl(device_fd, NBD_SET_SOCK, socket_fd) < 0 {
                return Err(NbdError::Io(io::Error::last_os_error()));
            }
        }

        let device_fd = unsafe { OwnedFd::from_raw_fd(device_file.into_raw_fd()) };

        // NBD_DO_IT blocks until the device is disconnected.
        let do_it_fd = device_fd.as_raw_fd();
        let do_it_handle = std::thread::spawn(move || {
            unsafe {
                if libc::ioctl(do_it_fd, NBD_DO_IT) < 0 {
                    let err = io::Error::last_os_error();
                    // ENOTCONN is the normal result of a disconnect.
                    if err.raw_os_error() != Some(libc::ENOTCONN) {
                        return Err(err);
                    }
                }
            }
            Ok(())
        });

        Ok(Self {
            device_path: device_path.to_string(),
            _device_fd: device_fd,
            do_it_handle: Some(do_it_handle),
            _socket: socket,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Disconnect the device from the server.
    pub fn disconnect(mut self) -> Result<(), NbdError> {
        self.disconnect_inner()
    }

    fn disconnect_inner(&mut self) -> Result<(), NbdError> {
        // Open the device fresh, as nbd-client -d does; the fd running
        // NBD_DO_IT cannot issue its own disconnect.
        let device_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device_path)?;

        disconnect(device_file.as_raw_fd())?;

        // The DO_IT thread exits on its own once the socket is cleared.
        let _ = self.do_it_handle.take();
        Ok(())
    }
}

impl Drop for NbdDevice {
    fn drop(&mut self) {
        let _ = self.disconnect_inner();
    }
}
