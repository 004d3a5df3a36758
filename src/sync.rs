//! Per-request completion signaling
//!
//! A thread that needs to sleep until some condition holds creates a
//! [`WaitState`] and hands [`Waker`]s to whoever will make the condition
//! true. The waiter re-checks its predicate around every block, so wakes may
//! be spurious and wakers never need to know what the waiter is waiting for.

use alloc::sync::Arc;
use core::sync::atomic::Ordering::{Relaxed, Release, SeqCst};

use crate::platform::{RawMutex, RawMutexProvider};

const NOT_WAITING: u32 = 0;
const WAITING: u32 = 1;

pub(crate) struct WaitState<P: RawMutexProvider> {
    state: Arc<P::RawMutex>,
}

pub(crate) struct Waker<P: RawMutexProvider> {
    state: Arc<P::RawMutex>,
}

impl<P: RawMutexProvider> Clone for Waker<P> {
    fn clone(&self) -> Self {
        Waker {
            state: self.state.clone(),
        }
    }
}

/// The waiter noticed its interrupt flag while the condition was still
/// false.
pub(crate) struct Interrupted;

impl<P: RawMutexProvider> WaitState<P> {
    pub(crate) fn new(platform: &P) -> Self {
        WaitState {
            state: Arc::new(platform.new_raw_mutex()),
        }
    }

    pub(crate) fn waker(&self) -> Waker<P> {
        Waker {
            state: self.state.clone(),
        }
    }

    /// Block until `ready` yields a value.
    ///
    /// `interrupted` is consulted whenever the condition is false; once it
    /// reports true the wait gives up with [`Interrupted`]. Both closures
    /// run on every pass, so an interrupt raised before the first block is
    /// seen without ever sleeping.
    pub(crate) fn wait<R>(
        &self,
        mut ready: impl FnMut() -> Option<R>,
        interrupted: impl Fn() -> bool,
    ) -> Result<R, Interrupted> {
        let raw = self.state.as_ref();
        let r = loop {
            raw.underlying_atomic().store(WAITING, SeqCst);
            if let Some(ret) = ready() {
                break Ok(ret);
            }
            if interrupted() {
                break Err(Interrupted);
            }
            let _ = raw.block(WAITING);
        };
        raw.underlying_atomic().store(NOT_WAITING, Relaxed);
        r
    }
}

impl<P: RawMutexProvider> Waker<P> {
    pub(crate) fn wake(&self) {
        if self.state.underlying_atomic().swap(NOT_WAITING, Release) == WAITING {
            self.state.wake_one();
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::platform::mock::MockPlatform;

    use core::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn wait_returns_immediately_when_ready() {
        let platform = MockPlatform::leaked();
        let ws = WaitState::new(platform);
        let r = ws.wait(|| Some(7), || false);
        assert!(matches!(r, Ok(7)));
    }

    #[test]
    fn wake_from_another_thread_unblocks_waiter() {
        let platform = MockPlatform::leaked();
        let ws = StdArc::new(WaitState::<MockPlatform>::new(platform));
        let flag = StdArc::new(AtomicBool::new(false));

        let waker = ws.waker();
        let flag2 = flag.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            flag2.store(true, Ordering::SeqCst);
            waker.wake();
        });

        let r = ws.wait(
            || flag.load(Ordering::SeqCst).then_some(()),
            || false,
        );
        assert!(r.is_ok());
        t.join().unwrap();
    }

    #[test]
    fn interrupt_raised_before_wait_is_observed() {
        let platform = MockPlatform::leaked();
        let ws = WaitState::<MockPlatform>::new(platform);
        let r = ws.wait(|| None::<()>, || true);
        assert!(r.is_err());
    }
}
