//! The blocking interface the embedder provides
//!
//! The client parks threads in three places: a caller waiting for its reply,
//! the completion worker waiting for the used ring to fill, and a submitter
//! waiting for ring space. All three go through a futex-shaped primitive
//! supplied by the platform, so the crate itself stays free of any scheduler
//! assumptions.

use core::sync::atomic::AtomicU32;

/// A provider of raw mutexes
pub trait RawMutexProvider {
    type RawMutex: RawMutex;
    /// Allocate a new [`RawMutex`].
    fn new_raw_mutex(&self) -> Self::RawMutex;
}

/// A raw mutex/lock API; expected to roughly match (or even be implemented
/// using) a Linux futex.
pub trait RawMutex: Send + Sync {
    /// Returns a reference to the underlying atomic value
    fn underlying_atomic(&self) -> &AtomicU32;

    /// Wake up `n` threads blocked on this raw mutex.
    ///
    /// Returns the number of waiters that were woken up.
    fn wake_many(&self, n: usize) -> usize;

    /// Wake up one thread blocked on this raw mutex.
    fn wake_one(&self) -> bool {
        self.wake_many(1) > 0
    }

    /// Wake up all threads that are blocked on this raw mutex.
    fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }

    /// If the underlying value is `val`, block until a wake operation wakes
    /// us up. Spurious wakeups are permitted.
    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp>;
}

/// A zero-sized struct indicating that the block returned immediately
/// because the underlying value did not match.
pub struct ImmediatelyWokenUp;
