//! Transport abstraction between the session and the device
//!
//! A transport moves one request's outbound PDU to the server and the reply
//! into its inbound PDU, completing the request's slot when the reply lands.
//! Only the virtio transport exists; the trait keeps the session ignorant of
//! ring mechanics and lets the tests substitute a scripted server.

use alloc::sync::Arc;

use crate::error::Error;
use crate::platform::RawMutexProvider;
use crate::reqtable::Req;

pub(crate) trait Transport<P: RawMutexProvider>: Send + Sync {
    /// Submit `req` to the device.
    ///
    /// Returns once the request is queued; completion is signaled through
    /// the request slot. Blocks only while the ring is full.
    fn request(&self, req: &Arc<Req<P>>) -> Result<(), Error>;

    /// Best-effort cancellation of an in-flight request.
    ///
    /// Returns true if the request was withdrawn before the server saw it.
    /// Virtio has no per-request cancel, so its transport always returns
    /// false and the session falls back to `Tflush`.
    fn cancel(&self, req: &Req<P>) -> bool;

    /// The largest msize this transport suggests negotiating.
    fn max_msize(&self) -> u32;

    /// Drop the device binding.
    ///
    /// In-flight and blocked requests fail with `ECONNRESET`; the device
    /// itself stays alive for a future binding.
    fn close(&self);
}
