use embassy_time::Instant;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::{
    hal::{Hal, HalResult},
    reg::DeviceIo,
    srng::{Srng, FLUSH_EVENT},
};

/// The pending doorbell slot of one ring.
///
/// Only the latest queued pointer value matters to the device, so the slot
/// holds exactly one value and every queue overwrites it (last-writer-wins).
/// Per-ring write order is preserved because the slot is only ever filled
/// under the ring lock; only the *number* of register writes shrinks.
pub(crate) struct PendingDoorbell {
    dirty: AtomicBool,
    value: AtomicU32,
    /// When the oldest unflushed value was queued, for diagnostics.
    enqueued_at: AtomicU64,
}
impl PendingDoorbell {
    pub(crate) const fn new() -> Self {
        Self {
            dirty: AtomicBool::new(false),
            value: AtomicU32::new(0),
            enqueued_at: AtomicU64::new(0),
        }
    }
    pub(crate) fn queue(&self, value: u32, now: Instant) {
        self.value.store(value, Ordering::Release);
        if !self.dirty.swap(true, Ordering::AcqRel) {
            self.enqueued_at.store(now.as_ticks(), Ordering::Relaxed);
        }
    }
    /// Claim the pending value, leaving the slot clean.
    pub(crate) fn take(&self) -> Option<u32> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(self.value.load(Ordering::Acquire))
        } else {
            None
        }
    }
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
    pub(crate) fn restore(&self, value: u32) {
        self.value.store(value, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }
    pub(crate) fn age(&self, now: Instant) -> Option<u64> {
        if !self.is_dirty() {
            return None;
        }
        Some(
            now.as_ticks()
                .saturating_sub(self.enqueued_at.load(Ordering::Relaxed)),
        )
    }
}

/// Delayed doorbell-write statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelayedWriteStats {
    /// Rings with a queued, unflushed doorbell value.
    pub pending: u32,
    /// Age of the oldest pending value, in timer ticks.
    pub oldest_pending_ticks: u64,
}

impl<B: DeviceIo> Hal<B> {
    /// Queue a doorbell value for `srng`, superseding any earlier pending
    /// value. Called with the ring lock held (from a deferring access
    /// bracket).
    pub(crate) fn doorbell_queue(&self, srng: &Srng, value: u32, now: Instant) {
        srng.pending.queue(value, now);
    }

    /// Write a doorbell register now, discarding any pending value it
    /// supersedes.
    ///
    /// A wake failure leaves the value queued and [FLUSH_EVENT] set, so a
    /// later access or flush retries it; the error still reaches the caller.
    pub(crate) fn doorbell_write(
        &self,
        srng: &Srng,
        offset: u32,
        value: u32,
        now: Instant,
    ) -> HalResult<()> {
        let _ = srng.pending.take();
        match self.write32(offset, value) {
            Ok(()) => {
                srng.record_flush(now);
                Ok(())
            }
            Err(err) => {
                srng.pending.restore(value);
                srng.set_event(FLUSH_EVENT);
                srng.flush_fail.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Flush `srng`'s pending doorbell value, if any. Idempotent: flushing
    /// with nothing pending is a no-op.
    pub(crate) fn flush_pending(&self, srng: &Srng) -> HalResult<()> {
        let Some(value) = srng.pending.take() else {
            return Ok(());
        };
        let offset = srng.db_offset.load(Ordering::Acquire);
        if offset == u32::MAX {
            // Memory-channel rings never queue; nothing to write.
            return Ok(());
        }
        match self.write32(offset, value) {
            Ok(()) => {
                srng.record_flush(Instant::now());
                Ok(())
            }
            Err(err) => {
                srng.pending.restore(value);
                srng.set_event(FLUSH_EVENT);
                srng.flush_fail.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Flush every ring with a pending doorbell value. Used at shutdown and
    /// forced-drain points. Takes each ring lock in turn; there is no
    /// cross-ring ordering guarantee.
    pub fn flush_all_doorbells(&self) {
        for srng in &self.rings {
            if !srng.initialized.load(Ordering::Acquire) || !srng.pending.is_dirty() {
                continue;
            }
            let _state = srng.state.lock();
            let _ = self.flush_pending(srng);
        }
    }

    /// Snapshot of the delayed-write layer, for diagnostics only.
    pub fn delayed_write_stats(&self) -> DelayedWriteStats {
        let now = Instant::now();
        let mut stats = DelayedWriteStats::default();
        for srng in &self.rings {
            if let Some(age) = srng.pending.age(now) {
                stats.pending += 1;
                stats.oldest_pending_ticks = stats.oldest_pending_ticks.max(age);
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ticks: u64) -> Instant {
        Instant::from_ticks(ticks)
    }

    #[test]
    fn last_writer_wins() {
        let pending = PendingDoorbell::new();
        pending.queue(4, at(10));
        pending.queue(8, at(20));
        pending.queue(12, at(30));
        assert_eq!(pending.take(), Some(12));
        assert_eq!(pending.take(), None);
    }

    #[test]
    fn age_tracks_oldest_queued_value() {
        let pending = PendingDoorbell::new();
        assert_eq!(pending.age(at(50)), None);
        pending.queue(4, at(10));
        // Re-queueing does not reset the age of the outstanding update.
        pending.queue(8, at(40));
        assert_eq!(pending.age(at(50)), Some(40));
        pending.take();
        assert_eq!(pending.age(at(50)), None);
    }

    #[test]
    fn restore_requeues_a_failed_value() {
        let pending = PendingDoorbell::new();
        pending.queue(4, at(10));
        let value = pending.take().unwrap();
        pending.restore(value);
        assert!(pending.is_dirty());
        assert_eq!(pending.take(), Some(4));
    }
}
