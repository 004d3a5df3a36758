//! # virtfs
//!
//! > A client for the 9P2000 family of remote file system protocols, spoken
//! > over a virtio queue.
//!
//! A guest mounts a directory tree exported by its host (QEMU's `-virtfs`,
//! or any hypervisor shared-folder service exposing a virtio-9p device) and
//! performs ordinary file system operations against it: lookup, open, read,
//! write, attribute manipulation, directory iteration, create, remove,
//! rename.
//!
//! The crate is split along the protocol's own seams:
//!
//! - [`fcall`] - typed 9P message definitions and their wire codec
//! - [`session`] - connection state: version negotiation, tags, fids, the
//!   RPC lifecycle, flush/cancel, disconnect
//! - `ops` - typed wrappers for each file system operation (on [`Session`])
//! - [`virtio`] - the virtio-9p transport: virtqueue, device binding,
//!   completion worker
//! - [`platform`] - the futex-shaped blocking interface the embedder
//!   provides
//!
//! To use the crate, implement [`platform::RawMutexProvider`] and
//! [`virtio::DeviceBackend`] for your environment, register discovered
//! devices in a [`virtio::DeviceRegistry`], and open a [`Session`] against a
//! device's mount tag.

#![no_std]

extern crate alloc;

pub mod error;
pub mod fcall;
mod idpool;
mod ops;
pub mod options;
mod pdu;
pub mod platform;
mod reqtable;
pub mod session;
mod sync;
mod transport;
pub mod virtio;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use ops::AT_REMOVEDIR;
pub use options::SessionOptions;
pub use session::{Fid, Session, SessionStatus};
