//! Split virtqueue
//!
//! One queue of [`QUEUE_DEPTH`] descriptors, in the legacy split layout:
//! descriptor table, available ring, used ring. Each 9P request occupies two
//! segments (the outbound PDU, device-readable, and the inbound PDU,
//! device-writable); when `VIRTIO_F_RING_INDIRECT_DESC` was negotiated the
//! pair lives in a per-request indirect table and costs a single ring
//! descriptor, otherwise it is a two-descriptor chain.
//!
//! The ring index fields are atomics: the driver publishes new available
//! entries with a Release store of `avail.idx`, and observes completions
//! with an Acquire load of `used.idx`, pairing with the device's own
//! ordering on the other side. Everything else in the ring is written
//! strictly before the corresponding index store.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU16, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Ring depth of the single virtio-9p queue
pub(crate) const QUEUE_DEPTH: usize = 128;

pub(crate) const VIRTQ_DESC_F_NEXT: u16 = 1;
pub(crate) const VIRTQ_DESC_F_WRITE: u16 = 2;
pub(crate) const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// One buffer the device should use
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// A device-visible buffer: translated address plus length.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DmaSlice {
    pub addr: u64,
    pub len: u32,
}

#[repr(C, align(16))]
struct DescTable {
    descs: [VirtqDesc; QUEUE_DEPTH],
}

#[repr(C)]
pub(crate) struct VirtqAvail {
    flags: u16,
    idx: AtomicU16,
    ring: [u16; QUEUE_DEPTH],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

#[repr(C)]
pub(crate) struct VirtqUsed {
    flags: u16,
    idx: AtomicU16,
    ring: [VirtqUsedElem; QUEUE_DEPTH],
}

/// The indirect table for one two-segment request
#[repr(C, align(16))]
struct IndirectTable {
    descs: [VirtqDesc; 2],
}

pub(crate) struct Virtqueue {
    desc: Box<DescTable>,
    avail: Box<VirtqAvail>,
    used: Box<VirtqUsed>,
    /// Free descriptor indexes, used as a stack
    free: Vec<u16>,
    /// Shadow of `avail.idx`
    avail_idx: u16,
    /// Next used-ring entry the driver has not consumed
    last_used_idx: u16,
    /// Per-head indirect tables, kept alive while the device may read them
    indirect: [Option<Box<IndirectTable>>; QUEUE_DEPTH],
    use_indirect: bool,
}

impl Virtqueue {
    pub(crate) fn new(use_indirect: bool) -> Virtqueue {
        Virtqueue {
            desc: Box::new(DescTable {
                descs: [VirtqDesc::default(); QUEUE_DEPTH],
            }),
            avail: Box::new(VirtqAvail {
                flags: 0,
                idx: AtomicU16::new(0),
                ring: [0; QUEUE_DEPTH],
            }),
            used: Box::new(VirtqUsed {
                flags: 0,
                idx: AtomicU16::new(0),
                ring: [VirtqUsedElem::default(); QUEUE_DEPTH],
            }),
            free: (0..QUEUE_DEPTH as u16).rev().collect(),
            avail_idx: 0,
            last_used_idx: 0,
            indirect: [const { None }; QUEUE_DEPTH],
            use_indirect,
        }
    }

    pub(crate) fn size(&self) -> u16 {
        QUEUE_DEPTH as u16
    }

    pub(crate) fn desc_ptr(&self) -> *const u8 {
        core::ptr::from_ref(self.desc.as_ref()).cast()
    }

    pub(crate) fn avail_ptr(&self) -> *const u8 {
        core::ptr::from_ref(self.avail.as_ref()).cast()
    }

    pub(crate) fn used_ptr(&self) -> *const u8 {
        core::ptr::from_ref(self.used.as_ref()).cast()
    }

    pub(crate) fn num_free(&self) -> usize {
        self.free.len()
    }

    fn descs_per_request(&self) -> usize {
        if self.use_indirect {
            1
        } else {
            2
        }
    }

    /// Place one out/in segment pair on the ring.
    ///
    /// Returns the head descriptor index, which doubles as the completion
    /// cookie, or `None` when the ring has no room.
    pub(crate) fn add(
        &mut self,
        out: DmaSlice,
        inb: DmaSlice,
        indirect_dma: impl FnOnce(*const u8) -> u64,
    ) -> Option<u16> {
        if self.free.len() < self.descs_per_request() {
            return None;
        }

        let head = if self.use_indirect {
            let head = self.free.pop().unwrap();
            let table = Box::new(IndirectTable {
                descs: [
                    VirtqDesc {
                        addr: out.addr,
                        len: out.len,
                        flags: VIRTQ_DESC_F_NEXT,
                        next: 1,
                    },
                    VirtqDesc {
                        addr: inb.addr,
                        len: inb.len,
                        flags: VIRTQ_DESC_F_WRITE,
                        next: 0,
                    },
                ],
            });
            self.desc.descs[head as usize] = VirtqDesc {
                addr: indirect_dma(core::ptr::from_ref(table.as_ref()).cast()),
                len: (2 * core::mem::size_of::<VirtqDesc>()) as u32,
                flags: VIRTQ_DESC_F_INDIRECT,
                next: 0,
            };
            self.indirect[head as usize] = Some(table);
            head
        } else {
            let head = self.free.pop().unwrap();
            let next = self.free.pop().unwrap();
            self.desc.descs[head as usize] = VirtqDesc {
                addr: out.addr,
                len: out.len,
                flags: VIRTQ_DESC_F_NEXT,
                next,
            };
            self.desc.descs[next as usize] = VirtqDesc {
                addr: inb.addr,
                len: inb.len,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            };
            head
        };

        self.avail.ring[self.avail_idx as usize % QUEUE_DEPTH] = head;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        // Publish: ring entry and descriptors must be visible before idx.
        self.avail.idx.store(self.avail_idx, Ordering::Release);
        Some(head)
    }

    /// Whether the device has produced completions we have not consumed.
    pub(crate) fn has_used(&self) -> bool {
        self.used.idx.load(Ordering::Acquire) != self.last_used_idx
    }

    /// Consume one used-ring entry, freeing its descriptors.
    ///
    /// Returns the head cookie and the byte count the device wrote.
    pub(crate) fn pop_used(&mut self) -> Option<(u16, u32)> {
        let used_idx = self.used.idx.load(Ordering::Acquire);
        if used_idx == self.last_used_idx {
            return None;
        }
        let elem = self.used.ring[self.last_used_idx as usize % QUEUE_DEPTH];
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let head = elem.id as u16;
        if head as usize >= QUEUE_DEPTH {
            // A corrupt cookie; drop the entry rather than index out of the
            // table.
            log::warn!("virtio-9p: used element id {} out of range", elem.id);
            return self.pop_used();
        }
        self.free_chain(head);
        Some((head, elem.len))
    }

    fn free_chain(&mut self, head: u16) {
        if self.indirect[head as usize].take().is_some() {
            self.free.push(head);
            return;
        }
        let mut index = head;
        loop {
            let desc = self.desc.descs[index as usize];
            self.free.push(index);
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            index = desc.next;
        }
    }
}
