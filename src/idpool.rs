//! Id pools for tags and fids
//!
//! Allocation rotates a last-id hint forward rather than always handing out
//! the smallest free id, so a tag that was just released is not immediately
//! reused; servers rely on that gap to tell a stale reply from a fresh
//! request on the same tag.

use hashbrown::HashSet;

/// Thread-safe allocator of small integer ids.
pub(crate) struct IdPool {
    inner: spin::Mutex<Inner>,
    limit: u32,
}

struct Inner {
    used: HashSet<u32>,
    last_id: u32,
}

impl IdPool {
    /// The largest id the default pool will hand out.
    pub(crate) const ID_MAX: u32 = i32::MAX as u32 - 1;

    pub(crate) fn new() -> IdPool {
        IdPool::with_limit(IdPool::ID_MAX)
    }

    /// A pool handing out ids in `[0, limit]`.
    pub(crate) fn with_limit(limit: u32) -> IdPool {
        IdPool {
            inner: spin::Mutex::new(Inner {
                used: HashSet::new(),
                // One behind zero, so the first allocation is id 0.
                last_id: limit,
            }),
            limit,
        }
    }

    /// Allocate the next free id after the rotation point, or `None` when
    /// the pool is saturated.
    pub(crate) fn get(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        let start = inner.last_id;
        let mut id = start;
        loop {
            id = if id >= self.limit { 0 } else { id + 1 };
            if !inner.used.contains(&id) {
                inner.used.insert(id);
                inner.last_id = id;
                return Some(id);
            }
            if id == start {
                return None;
            }
        }
    }

    /// Release an id for future reuse.
    pub(crate) fn put(&self, id: u32) {
        self.inner.lock().used.remove(&id);
    }

    /// Whether `id` is currently allocated. Used to guard against releasing
    /// an id twice.
    pub(crate) fn contains(&self, id: u32) -> bool {
        self.inner.lock().used.contains(&id)
    }
}
