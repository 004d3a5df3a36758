//! In-flight request slots
//!
//! Requests are tracked in a two-dimensional array indexed by tag rather
//! than a hash table; the tag is the index, so lookup on the completion path
//! is two shifts and a load. Rows are allocated the first time a tag in them
//! is used and slots (including their PDU buffers) are reused across tag
//! reuse. Indexing is by `tag + 1` so that `NOTAG` (0xFFFF) wraps to slot 0
//! and version negotiation gets a regular slot.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::pdu::Pdu;
use crate::platform::RawMutexProvider;
use crate::sync::WaitState;

/// Requests per row
pub(crate) const ROW_SIZE: usize = 256;

/// Rows in the table; with [`ROW_SIZE`] this covers every 16-bit tag.
pub(crate) const MAX_ROWS: usize = 256;

/// Status of a request slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub(crate) enum ReqStatus {
    /// Slot unused
    Idle = 0,
    /// Allocated to a call, not yet marshalled
    Alloc,
    /// Marshalled, not yet handed to the transport
    Unsent,
    /// On the ring, awaiting a reply
    Sent,
    /// Reply bytes are in `rc`
    Received,
    /// The transport failed the request; see `t_err`
    Error,
    /// Flushed without a reply
    Flushed,
}

/// One request slot: a row of the request table.
pub(crate) struct Req<P: RawMutexProvider> {
    tag: u16,
    status: AtomicU8,
    t_err: AtomicI32,
    interrupted: AtomicBool,
    bufs: spin::Mutex<ReqBufs>,
    wait: WaitState<P>,
}

/// The two PDU buffers of a slot.
///
/// Both are `None` only while the request is on the ring: the transport
/// takes ownership for the duration of device access and hands the buffers
/// back on completion, so nothing aliases memory the device may write.
pub(crate) struct ReqBufs {
    pub(crate) tc: Option<Pdu>,
    pub(crate) rc: Option<Pdu>,
}

impl<P: RawMutexProvider> Req<P> {
    fn new(platform: &P, tag: u16) -> Req<P> {
        Req {
            tag,
            status: AtomicU8::new(ReqStatus::Idle.into()),
            t_err: AtomicI32::new(0),
            interrupted: AtomicBool::new(false),
            bufs: spin::Mutex::new(ReqBufs { tc: None, rc: None }),
            wait: WaitState::new(platform),
        }
    }

    pub(crate) fn tag(&self) -> u16 {
        self.tag
    }

    /// Current status; pairs with the Release store in [`Req::set_status`]
    /// so a caller that observes `Received` also observes the reply bytes.
    pub(crate) fn status(&self) -> ReqStatus {
        ReqStatus::try_from(self.status.load(Ordering::Acquire)).unwrap_or(ReqStatus::Error)
    }

    pub(crate) fn set_status(&self, status: ReqStatus) {
        self.status.store(status.into(), Ordering::Release);
    }

    pub(crate) fn t_err(&self) -> i32 {
        self.t_err.load(Ordering::Acquire)
    }

    /// Publish a completion and wake the parked caller.
    pub(crate) fn complete(&self, status: ReqStatus) {
        self.set_status(status);
        self.wait.waker().wake();
    }

    /// Fail the request with a transport errno and wake the caller.
    pub(crate) fn fail(&self, errno: i32) {
        self.t_err.store(errno, Ordering::Release);
        self.complete(ReqStatus::Error);
    }

    /// Interrupt a caller blocked on this request.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.wait.waker().wake();
    }

    /// Block until the request leaves `Sent`; `Err` means interrupted.
    pub(crate) fn wait_done(&self) -> Result<ReqStatus, crate::sync::Interrupted> {
        self.wait.wait(
            || {
                let status = self.status();
                (!matches!(
                    status,
                    ReqStatus::Sent | ReqStatus::Unsent | ReqStatus::Alloc
                ))
                .then_some(status)
            },
            || self.interrupted.load(Ordering::Acquire),
        )
    }

    /// Take both buffers for the duration of device access.
    pub(crate) fn take_bufs(&self) -> Option<(Pdu, Pdu)> {
        let mut bufs = self.bufs.lock();
        match (bufs.tc.take(), bufs.rc.take()) {
            (Some(tc), Some(rc)) => Some((tc, rc)),
            (tc, rc) => {
                bufs.tc = tc;
                bufs.rc = rc;
                None
            }
        }
    }

    /// Hand the buffers back after device access.
    pub(crate) fn put_bufs(&self, tc: Pdu, rc: Pdu) {
        let mut bufs = self.bufs.lock();
        bufs.tc = Some(tc);
        bufs.rc = Some(rc);
    }

    pub(crate) fn with_bufs<R>(&self, f: impl FnOnce(&mut ReqBufs) -> R) -> R {
        f(&mut self.bufs.lock())
    }

    /// Move the reply PDU out of the slot; the caller parses it and puts it
    /// back when releasing the slot.
    pub(crate) fn take_rc(&self) -> Option<Pdu> {
        self.bufs.lock().rc.take()
    }

    pub(crate) fn put_rc(&self, rc: Pdu) {
        self.bufs.lock().rc = Some(rc);
    }
}

/// The 2-D request table.
pub(crate) struct RequestTable<P: RawMutexProvider + 'static> {
    platform: &'static P,
    /// Row vector; grown under the write lock, rows themselves are
    /// immutable once published.
    rows: spin::RwLock<Vec<Arc<[Arc<Req<P>>]>>>,
}

impl<P: RawMutexProvider + 'static> RequestTable<P> {
    pub(crate) fn new(platform: &'static P) -> RequestTable<P> {
        RequestTable {
            platform,
            rows: spin::RwLock::new(Vec::new()),
        }
    }

    fn slot_index(tag: u16) -> (usize, usize) {
        let index = tag.wrapping_add(1) as usize;
        (index / ROW_SIZE, index % ROW_SIZE)
    }

    /// Allocate the slot for `tag` and size its buffers to
    /// `min(msize, max_size)`.
    pub(crate) fn alloc(&self, tag: u16, msize: u32, max_size: u32) -> Arc<Req<P>> {
        let (row, col) = Self::slot_index(tag);
        debug_assert!(row < MAX_ROWS);

        {
            let rows = self.rows.read();
            if row < rows.len() {
                let req = rows[row][col].clone();
                return self.prepare_slot(req, msize, max_size);
            }
        }

        let mut rows = self.rows.write();
        // Re-check; another thread may have grown the table while we
        // upgraded the lock.
        while rows.len() <= row {
            let base = rows.len() * ROW_SIZE;
            let slots: Vec<Arc<Req<P>>> = (0..ROW_SIZE)
                .map(|col| {
                    Arc::new(Req::new(
                        self.platform,
                        ((base + col) as u16).wrapping_sub(1),
                    ))
                })
                .collect();
            rows.push(slots.into());
        }
        let req = rows[row][col].clone();
        drop(rows);
        self.prepare_slot(req, msize, max_size)
    }

    fn prepare_slot(&self, req: Arc<Req<P>>, msize: u32, max_size: u32) -> Arc<Req<P>> {
        let alloc_size = msize.min(max_size) as usize;
        {
            let mut bufs = req.bufs.lock();
            match &mut bufs.tc {
                Some(tc) => {
                    tc.ensure_capacity(alloc_size);
                    tc.reset();
                }
                tc @ None => *tc = Some(Pdu::with_capacity(alloc_size)),
            }
            match &mut bufs.rc {
                Some(rc) => {
                    rc.ensure_capacity(alloc_size);
                    rc.reset();
                }
                rc @ None => *rc = Some(Pdu::with_capacity(alloc_size)),
            }
        }
        req.t_err.store(0, Ordering::Relaxed);
        req.interrupted.store(false, Ordering::Relaxed);
        req.set_status(ReqStatus::Alloc);
        req
    }

    /// Look up the slot for `tag`, if its row exists.
    pub(crate) fn lookup(&self, tag: u16) -> Option<Arc<Req<P>>> {
        let (row, col) = Self::slot_index(tag);
        let rows = self.rows.read();
        rows.get(row).map(|r| r[col].clone())
    }

    /// Return the slot to `Idle`.
    pub(crate) fn free(&self, req: &Req<P>) {
        req.set_status(ReqStatus::Idle);
    }
}
