//! The virtio-9p transport
//!
//! Each discovered device is wrapped in a [`Virtio9p`] and registered in a
//! [`DeviceRegistry`]; a session binds to a device by its mount tag (the
//! UTF-8 string in config space, advertised via feature bit 0). One device
//! carries at most one session at a time.
//!
//! Submission fills a two-segment scatter-gather (outbound PDU, inbound PDU)
//! under the device's submission lock, kicks the doorbell and returns; the
//! dedicated completion worker sleeps until the interrupt handler reports
//! the used ring non-empty, then drains it, matching completions to requests
//! by the head-descriptor cookie and waking each parked caller through its
//! request slot.

mod hal;
mod queue;

pub use hal::{features, status, DeviceBackend, VIRTIO_9P_DEVICE_ID};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{errno, Error};
use crate::pdu::Pdu;
use crate::platform::RawMutexProvider;
use crate::reqtable::{Req, ReqStatus};
use crate::sync::WaitState;
use crate::transport::Transport;

use queue::{DmaSlice, Virtqueue, QUEUE_DEPTH};

const PAGE_SIZE: u32 = 4096;

/// A request the device currently owns.
///
/// The PDU buffers live here, not in the request slot, for as long as the
/// device may read or write them. `req` is `None` once the binding that
/// issued the request is gone; the completion then just returns the
/// descriptors.
struct PendingReq<P: RawMutexProvider> {
    req: Option<Arc<Req<P>>>,
    tc: Pdu,
    rc: Pdu,
}

struct QueueState<P: RawMutexProvider> {
    vq: Virtqueue,
    pending: Vec<Option<PendingReq<P>>>,
}

/// One virtio-9p device and its single virtqueue.
pub struct Virtio9p<P: RawMutexProvider + 'static> {
    backend: Box<dyn DeviceBackend>,
    mount_tag: String,
    /// Submission state; held across ring fill and kick, never across a
    /// wait.
    state: spin::Mutex<QueueState<P>>,
    /// Parked completion worker; raised by the interrupt handler.
    used_signal: WaitState<P>,
    /// Parked submitters waiting for ring space.
    space_signal: WaitState<P>,
    /// Whether a session currently owns this device.
    bound: AtomicBool,
    /// Device teardown; stops the worker.
    shutdown: AtomicBool,
}

enum WorkerWake {
    Drain,
    Shutdown,
}

impl<P: RawMutexProvider + 'static> Virtio9p<P> {
    /// Initialize a discovered device: negotiate features, read the mount
    /// tag, register the queue and set `DRIVER_OK`.
    ///
    /// The caller must give the returned device a completion worker by
    /// running [`Virtio9p::run_worker`] on a dedicated thread, and must
    /// route the device's interrupt to [`Virtio9p::on_interrupt`].
    pub fn new(platform: &'static P, backend: Box<dyn DeviceBackend>) -> Result<Arc<Self>, Error> {
        backend.set_status(status::ACKNOWLEDGE);
        backend.set_status(status::ACKNOWLEDGE | status::DRIVER);

        let offered = backend.device_features();
        let accepted =
            offered & (features::VIRTIO_9P_F_MOUNT_TAG | features::VIRTIO_F_RING_INDIRECT_DESC);
        backend.ack_features(accepted);
        backend.set_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK);

        if accepted & features::VIRTIO_9P_F_MOUNT_TAG == 0 {
            backend.set_status(status::FAILED);
            return Err(Error::NoDevice);
        }

        let mut tag_len = [0u8; 2];
        backend.read_config(0, &mut tag_len);
        let tag_len = u16::from_le_bytes(tag_len) as usize;
        let mut tag = alloc::vec![0u8; tag_len];
        backend.read_config(2, &mut tag);
        let mount_tag = String::from_utf8_lossy(&tag).into_owned();

        let vq = Virtqueue::new(accepted & features::VIRTIO_F_RING_INDIRECT_DESC != 0);
        backend.setup_queue(
            0,
            vq.size(),
            backend.dma_address(vq.desc_ptr()),
            backend.dma_address(vq.avail_ptr()),
            backend.dma_address(vq.used_ptr()),
        );

        let device = Arc::new(Virtio9p {
            mount_tag,
            state: spin::Mutex::new(QueueState {
                vq,
                pending: (0..QUEUE_DEPTH).map(|_| None).collect(),
            }),
            used_signal: WaitState::new(platform),
            space_signal: WaitState::new(platform),
            bound: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            backend,
        });

        device
            .backend
            .set_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK);
        log::info!(
            "virtio-9p: device ready, mount tag \"{}\", indirect descriptors {}",
            device.mount_tag,
            if accepted & features::VIRTIO_F_RING_INDIRECT_DESC != 0 {
                "on"
            } else {
                "off"
            }
        );
        Ok(device)
    }

    /// The mount tag this device advertises.
    pub fn mount_tag(&self) -> &str {
        &self.mount_tag
    }

    /// Interrupt entry point; call from the device's IRQ handler.
    pub fn on_interrupt(&self) {
        if self.backend.ack_interrupt() {
            self.used_signal.waker().wake();
        }
    }

    /// The completion worker loop.
    ///
    /// Sleeps until the used ring is non-empty, drains it, completes the
    /// matched requests and wakes any submitter parked on a full ring.
    /// Returns when [`Virtio9p::stop`] is called.
    pub fn run_worker(&self) {
        loop {
            let wake = self.used_signal.wait(
                || {
                    if self.shutdown.load(Ordering::Acquire) {
                        return Some(WorkerWake::Shutdown);
                    }
                    self.state
                        .lock()
                        .vq
                        .has_used()
                        .then_some(WorkerWake::Drain)
                },
                || false,
            );
            match wake {
                Ok(WorkerWake::Drain) => self.drain_used(),
                Ok(WorkerWake::Shutdown) | Err(_) => break,
            }
        }
    }

    fn drain_used(&self) {
        loop {
            let completion = {
                let mut state = self.state.lock();
                match state.vq.pop_used() {
                    Some((head, len)) => Some((state.pending[head as usize].take(), len)),
                    None => None,
                }
            };
            let Some((pending, len)) = completion else {
                break;
            };
            if let Some(PendingReq { req, tc, mut rc }) = pending {
                if let Some(req) = req {
                    rc.set_size(len as usize);
                    req.put_bufs(tc, rc);
                    if len == 0 {
                        // The device consumed the request but wrote nothing;
                        // there is no reply to parse.
                        req.fail(errno::EIO);
                    } else {
                        req.complete(ReqStatus::Received);
                    }
                }
            }
            // A descriptor was freed; a submitter may be waiting for it.
            self.space_signal.waker().wake();
        }
    }

    /// Stop the completion worker and fail everything in flight.
    ///
    /// For driver teardown; an unbind ([`Transport::close`]) leaves the
    /// worker running for the next session.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.fail_inflight();
        self.used_signal.waker().wake();
        self.space_signal.waker().wake();
    }

    /// Fail every request the device still owns with `ECONNRESET`.
    ///
    /// The PDU buffers stay with the queue until the device actually
    /// returns the descriptors; the failed slots grow fresh buffers on next
    /// use.
    fn fail_inflight(&self) {
        let mut state = self.state.lock();
        for slot in state.pending.iter_mut() {
            if let Some(pending) = slot {
                if let Some(req) = pending.req.take() {
                    req.fail(errno::ECONNRESET);
                }
            }
        }
    }

    pub(crate) fn bind(&self) -> bool {
        self.bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<P: RawMutexProvider + 'static> Transport<P> for Virtio9p<P> {
    fn request(&self, req: &Arc<Req<P>>) -> Result<(), Error> {
        let Some(bufs) = req.take_bufs() else {
            return Err(Error::Protocol);
        };
        req.set_status(ReqStatus::Sent);

        let mut bufs = Some(bufs);
        let outcome = self.space_signal.wait(
            || {
                if !self.bound.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire) {
                    return Some(Err(Error::Transport(errno::ECONNRESET)));
                }
                let (tc, mut rc) = bufs.take().unwrap();
                let out = DmaSlice {
                    addr: self.backend.dma_address(tc.bytes().as_ptr()),
                    len: tc.size() as u32,
                };
                let inb = DmaSlice {
                    addr: self.backend.dma_address(rc.raw_mut().as_ptr()),
                    len: rc.capacity() as u32,
                };

                let mut state = self.state.lock();
                match state
                    .vq
                    .add(out, inb, |table| self.backend.dma_address(table))
                {
                    Some(head) => {
                        state.pending[head as usize] = Some(PendingReq {
                            req: Some(req.clone()),
                            tc,
                            rc,
                        });
                        self.backend.notify(0);
                        Some(Ok(()))
                    }
                    None => {
                        // Ring full; park until a completion frees room.
                        log::debug!(
                            "virtio-9p: queue full ({} descriptors free)",
                            state.vq.num_free()
                        );
                        bufs = Some((tc, rc));
                        None
                    }
                }
            },
            || false,
        );

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                if let Some((tc, rc)) = bufs.take() {
                    req.put_bufs(tc, rc);
                }
                Err(err)
            }
            // The submitter wait is not interruptible.
            Err(_) => Err(Error::Transport(errno::ECONNRESET)),
        }
    }

    fn cancel(&self, _req: &Req<P>) -> bool {
        // Virtio 9P has no per-request cancellation.
        false
    }

    fn max_msize(&self) -> u32 {
        PAGE_SIZE * (QUEUE_DEPTH as u32 - 3)
    }

    fn close(&self) {
        self.fail_inflight();
        self.bound.store(false, Ordering::Release);
        // Submitters parked on ring space belong to the closed binding.
        self.space_signal.waker().wake();
    }
}

/// The set of discovered virtio-9p devices.
///
/// Owned by the driver subsystem and handed to sessions explicitly; its
/// lifetime bounds every binding made through it.
pub struct DeviceRegistry<P: RawMutexProvider + 'static> {
    devices: spin::Mutex<Vec<Arc<Virtio9p<P>>>>,
}

impl<P: RawMutexProvider + 'static> DeviceRegistry<P> {
    pub fn new() -> DeviceRegistry<P> {
        DeviceRegistry {
            devices: spin::Mutex::new(Vec::new()),
        }
    }

    /// Add a device initialized with [`Virtio9p::new`].
    pub fn register(&self, device: Arc<Virtio9p<P>>) {
        self.devices.lock().push(device);
    }

    /// Attach to the first unowned device whose mount tag is `name`.
    pub(crate) fn bind(&self, name: &str) -> Result<Arc<Virtio9p<P>>, Error> {
        let devices = self.devices.lock();
        let mut any_match = false;
        for device in devices.iter() {
            if device.mount_tag == name {
                any_match = true;
                if device.bind() {
                    return Ok(device.clone());
                }
            }
        }
        Err(if any_match { Error::Busy } else { Error::NoDevice })
    }
}

impl<P: RawMutexProvider + 'static> Default for DeviceRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
