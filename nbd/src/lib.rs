//! NBD (Network Block Device) protocol support for wharf.
//!
//! Wire types and constants for the fixed-size NBD frames, an async
//! client, and (behind the `device` feature) Linux kernel NBD device
//! helpers.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod client;
mod protocol;

#[cfg(feature = "device")]
mod device;

pub use client::NbdClient;
pub use protocol::*;

#[cfg(feature = "device")]
pub use device::{NbdDevice, disconnect};
