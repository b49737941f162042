use core::{future::poll_fn, task::Poll};

use atomic_waker::AtomicWaker;
use embassy_time::Instant;
use portable_atomic::{AtomicU64, Ordering};

/// Tick value meaning "no deadline armed".
const UNARMED: u64 = u64::MAX;

/// A single shared deadline, which can only ever be tightened while armed.
///
/// This backs the coalescing flush timers: packet handlers arm or tighten the
/// deadline from any context, and one async task waits on it and performs the
/// doorbell flush when it expires. Re-arming to a *later* point in time is
/// deliberately impossible; the deadline is released only by expiry or an
/// explicit [cancel](Self::cancel).
pub struct DeadlineSignal {
    deadline: AtomicU64,
    waker: AtomicWaker,
}
impl DeadlineSignal {
    pub const fn new() -> Self {
        Self {
            deadline: AtomicU64::new(UNARMED),
            waker: AtomicWaker::new(),
        }
    }
    /// Arm the deadline, or tighten an already armed one.
    ///
    /// If the signal is unarmed, it becomes armed for `at`. If it is armed for
    /// a point *after* `at`, it is re-armed for `at`. Otherwise the armed
    /// deadline is left alone. Returns the deadline now in effect.
    pub fn arm_or_tighten(&self, at: Instant) -> Instant {
        let prev = self.deadline.fetch_min(at.as_ticks(), Ordering::AcqRel);
        if at.as_ticks() < prev {
            self.waker.wake();
        }
        Instant::from_ticks(prev.min(at.as_ticks()))
    }
    /// Disarm the deadline without waiting for expiry.
    pub fn cancel(&self) {
        self.deadline.store(UNARMED, Ordering::Release);
        self.waker.wake();
    }
    /// The currently armed deadline, if any.
    pub fn armed_deadline(&self) -> Option<Instant> {
        match self.deadline.load(Ordering::Acquire) {
            UNARMED => None,
            ticks => Some(Instant::from_ticks(ticks)),
        }
    }
    /// Disarm and return the deadline, if it has passed as of `now`.
    ///
    /// A concurrent tighten wins over the disarm, so a freshly shortened
    /// deadline is never lost to an expiry racing it.
    pub fn take_expired(&self, now: Instant) -> Option<Instant> {
        let current = self.deadline.load(Ordering::Acquire);
        if current == UNARMED || current > now.as_ticks() {
            return None;
        }
        self.deadline
            .compare_exchange(current, UNARMED, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(Instant::from_ticks)
    }
    /// Asynchronously wait until a deadline is armed, resolving with it.
    pub async fn wait_armed(&self) -> Instant {
        poll_fn(|cx| {
            let ticks = self.deadline.load(Ordering::Acquire);
            if ticks != UNARMED {
                Poll::Ready(Instant::from_ticks(ticks))
            } else {
                self.waker.register(cx.waker());
                Poll::Pending
            }
        })
        .await
    }
    /// Asynchronously wait for the armed deadline to move away from `since`,
    /// either by tightening or by cancellation.
    pub async fn changed(&self, since: Instant) {
        poll_fn(|cx| {
            if self.deadline.load(Ordering::Acquire) != since.as_ticks() {
                Poll::Ready(())
            } else {
                self.waker.register(cx.waker());
                Poll::Pending
            }
        })
        .await
    }
}
impl Default for DeadlineSignal {
    fn default() -> Self {
        Self::new()
    }
}
