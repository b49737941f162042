use core::{marker::PhantomData, ptr, slice};

use bitfield_struct::bitfield;
use embassy_time::Instant;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::{
    delayed::PendingDoorbell,
    hal::{Hal, HalError, HalResult},
    reg::DeviceIo,
};

/// Number of ring slots in the [Hal] arena.
pub const MAX_RINGS: usize = 16;

/// Number of fill-level histogram bins (<50%, 50-60%, ..., 90-100%).
pub const WM_BINS: usize = 6;
const WM_BIN_THRESH_PCT: [u32; WM_BINS] = [0, 50, 60, 70, 80, 90];

/// Event bit consumed by the next committing access bracket: a timer context
/// wanted a doorbell flush but found the ring busy.
pub const FLUSH_EVENT: u32 = 1 << 0;

#[bitfield(u32)]
pub struct SrngFlags {
    /// Ring pointer updates go through FW-shared memory instead of a doorbell
    /// register.
    pub lmac_ring: bool,
    /// The device exchanges pointer values in little-endian order regardless
    /// of host byte order.
    pub ptr_le: bool,
    /// Descriptors live in cacheable memory and need invalidate + prefetch
    /// before the host reads them.
    pub cached_desc: bool,
    pub msi_swap: bool,
    pub msi_intr: bool,
    pub low_thresh_intr: bool,
    pub nf_irq_support: bool,
    #[bits(25)]
    pub __: u32,
}

/// Ring direction as seen from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SrngDir {
    /// Host produces, device consumes.
    Source,
    /// Device produces, host consumes.
    Destination,
}

/// Marker type for source-ring handles.
pub struct Src;
/// Marker type for destination-ring handles.
pub struct Dst;

/// Parameters for [Hal::setup_src_ring](crate::Hal::setup_src_ring) and
/// [Hal::setup_dst_ring](crate::Hal::setup_dst_ring).
///
/// Callers allocate contiguous, device-visible ring memory of at least
/// `num_entries * entry_size * 4` bytes and pass its virtual and bus
/// addresses here. The base address must be 8 byte aligned.
#[derive(Clone, Copy, Debug)]
pub struct SrngParams {
    pub ring_base_vaddr: *mut u32,
    pub ring_base_paddr: u64,
    /// Length of the memory region behind `ring_base_vaddr` in bytes.
    pub ring_len_bytes: usize,
    pub num_entries: u32,
    /// Size of one ring entry in 32-bit words. Not required to be a power of
    /// two.
    pub entry_size: u32,
    /// Arena slot, doubles as the index into the shared pointer memory.
    pub ring_id: u8,
    pub flags: SrngFlags,
    /// Low-water interrupt threshold, source rings only.
    pub low_threshold: u32,
    /// Base offset of this ring's register block.
    pub hwreg_base: u32,
}

/// Where host-side pointer updates for a ring go.
#[derive(Clone, Copy)]
pub(crate) enum Doorbell {
    None,
    /// Doorbell register offset; written through the register accessor and
    /// the delayed-write layer.
    Register(u32),
    /// FW-shared memory word, written directly.
    Memory(*mut u32),
}

pub(crate) struct SrcPtrs {
    pub(crate) hp: u32,
    pub(crate) reap_hp: u32,
    pub(crate) cached_tp: u32,
    pub(crate) last_cleared: u32,
}

pub(crate) struct DstPtrs {
    pub(crate) tp: u32,
    pub(crate) cached_hp: u32,
}

pub(crate) enum RingPtrs {
    Src(SrcPtrs),
    Dst(DstPtrs),
}

/// Fill-level high-watermark histogram.
pub(crate) struct HighWatermark {
    pub(crate) val: u32,
    pub(crate) timestamp: u64,
    pub(crate) bin_thresh: [u32; WM_BINS],
    pub(crate) bins: [u32; WM_BINS],
}
impl HighWatermark {
    pub(crate) const fn new() -> Self {
        Self {
            val: 0,
            timestamp: 0,
            bin_thresh: [0; WM_BINS],
            bins: [0; WM_BINS],
        }
    }
    fn set_thresholds(&mut self, num_entries: u32) {
        for (threshold, pct) in self.bin_thresh.iter_mut().zip(WM_BIN_THRESH_PCT) {
            *threshold = num_entries * pct / 100;
        }
    }
    fn update(&mut self, fill: u32, now_ticks: u64) {
        if fill > self.val {
            self.val = fill;
            self.timestamp = now_ticks;
        }
        let mut bin = 0;
        for candidate in (1..WM_BINS).rev() {
            if fill >= self.bin_thresh[candidate] {
                bin = candidate;
                break;
            }
        }
        self.bins[bin] += 1;
    }
    fn clear(&mut self) {
        self.val = 0;
        self.timestamp = 0;
        self.bins = [0; WM_BINS];
    }
}

/// Mutable ring state, everything behind the per-ring lock.
pub(crate) struct SrngState {
    pub(crate) base: *mut u32,
    /// Ring size in 32-bit words (`num_entries * entry_size`).
    pub(crate) ring_size: u32,
    pub(crate) num_entries: u32,
    /// Entry size in 32-bit words.
    pub(crate) entry_size: u32,
    pub(crate) flags: SrngFlags,
    pub(crate) low_threshold: u32,
    pub(crate) hwreg_base: u32,
    /// Device-updated pointer word: the tail for source rings, the head for
    /// destination rings.
    pub(crate) hw_ptr: *const u32,
    pub(crate) doorbell: Doorbell,
    pub(crate) ptrs: RingPtrs,
    pub(crate) high_wm: HighWatermark,
}

impl SrngState {
    pub(crate) const fn unbound() -> Self {
        Self {
            base: ptr::null_mut(),
            ring_size: 0,
            num_entries: 0,
            entry_size: 0,
            flags: SrngFlags::new(),
            low_threshold: 0,
            hwreg_base: 0,
            hw_ptr: ptr::null(),
            doorbell: Doorbell::None,
            ptrs: RingPtrs::Src(SrcPtrs {
                hp: 0,
                reap_hp: 0,
                cached_tp: 0,
                last_cleared: 0,
            }),
            high_wm: HighWatermark::new(),
        }
    }

    /// Entry sizes are not powers of two, so offsets wrap by modulo, never by
    /// masking.
    fn next_offset(&self, offset: u32) -> u32 {
        (offset + self.entry_size) % self.ring_size
    }
    fn desc_at(&self, offset: u32) -> *mut u32 {
        debug_assert!(offset < self.ring_size);
        // SAFETY: `offset` is always a multiple of `entry_size` below
        // `ring_size`, which the setup path validated against the backing
        // region.
        unsafe { self.base.add(offset as usize) }
    }
    fn ring_end(&self) -> *mut u32 {
        // SAFETY: one past the end of the validated ring region.
        unsafe { self.base.add(self.ring_size as usize) }
    }

    /// Read the device-updated pointer word.
    fn read_hw_ptr(&self) -> u32 {
        // SAFETY: `hw_ptr` points at the device-updated pointer word supplied
        // at setup and stays valid for the lifetime of the ring.
        let raw = unsafe { ptr::read_volatile(self.hw_ptr) };
        if self.flags.ptr_le() {
            u32::from_le(raw)
        } else {
            raw
        }
    }

    /// Refresh the cached copy of the device-owned pointer. This is the
    /// unlocked refresh primitive; the access brackets call it with the ring
    /// lock held.
    pub(crate) fn sync_cached_ptr(&mut self) {
        let value = self.read_hw_ptr();
        match &mut self.ptrs {
            RingPtrs::Src(p) => p.cached_tp = value,
            RingPtrs::Dst(p) => p.cached_hp = value,
        }
    }

    fn src(&mut self) -> &mut SrcPtrs {
        let RingPtrs::Src(p) = &mut self.ptrs else {
            unreachable!("source op on a destination ring")
        };
        p
    }
    fn dst(&mut self) -> &mut DstPtrs {
        let RingPtrs::Dst(p) = &mut self.ptrs else {
            unreachable!("destination op on a source ring")
        };
        p
    }

    // Source ring index arithmetic. One slot is always left empty, so
    // `hp == tp` is empty and `hp + 1 == tp` is full.

    pub(crate) fn src_get_next(&mut self) -> Option<*mut u32> {
        let p = self.src();
        let (hp, cached_tp) = (p.hp, p.cached_tp);
        let next_hp = self.next_offset(hp);
        if next_hp == cached_tp {
            return None;
        }
        let desc = self.desc_at(hp);
        let p = self.src();
        p.hp = next_hp;
        // Rings that never reap keep reap_hp pinned to hp.
        p.reap_hp = next_hp;
        Some(desc)
    }

    pub(crate) fn src_peek(&mut self) -> Option<*mut u32> {
        let p = self.src();
        let (hp, cached_tp) = (p.hp, p.cached_tp);
        if self.next_offset(hp) == cached_tp {
            return None;
        }
        Some(self.desc_at(hp))
    }

    /// Look two entries past `hp` without moving it.
    pub(crate) fn src_peek_next2(&mut self) -> Option<*mut u32> {
        let p = self.src();
        let (hp, cached_tp) = (p.hp, p.cached_tp);
        let next = self.next_offset(hp);
        let next2 = self.next_offset(next);
        if next == cached_tp || next2 == cached_tp {
            return None;
        }
        Some(self.desc_at(next2))
    }

    /// Return the current `hp` slot unconditionally and advance if there is
    /// room. Init-time replenish only.
    pub(crate) fn src_get_cur_and_move(&mut self) -> *mut u32 {
        let p = self.src();
        let (hp, cached_tp) = (p.hp, p.cached_tp);
        let desc = self.desc_at(hp);
        let next_hp = self.next_offset(hp);
        if next_hp != cached_tp {
            self.src().hp = next_hp;
        }
        desc
    }

    /// Advance `reap_hp` over the next device-consumed entry, so its buffer
    /// can be reclaimed. Posting a fresh descriptor into a reaped slot goes
    /// through [src_get_next_reaped](Self::src_get_next_reaped).
    pub(crate) fn src_reap_next(&mut self) -> Option<*mut u32> {
        let p = self.src();
        let (reap_hp, cached_tp) = (p.reap_hp, p.cached_tp);
        let next_reap_hp = self.next_offset(reap_hp);
        if next_reap_hp == cached_tp {
            return None;
        }
        let desc = self.desc_at(next_reap_hp);
        self.src().reap_hp = next_reap_hp;
        Some(desc)
    }

    /// Post into a slot previously confirmed free by
    /// [src_reap_next](Self::src_reap_next). `hp` never passes `reap_hp`, so
    /// a slot is not reused before the device has released its previous
    /// occupant.
    pub(crate) fn src_get_next_reaped(&mut self) -> Option<*mut u32> {
        let p = self.src();
        let (hp, reap_hp) = (p.hp, p.reap_hp);
        if hp == reap_hp {
            return None;
        }
        let desc = self.desc_at(hp);
        let next_hp = self.next_offset(hp);
        self.src().hp = next_hp;
        Some(desc)
    }

    /// Detach-path reap: walk entries that were posted but never reaped, up
    /// to `hp`.
    pub(crate) fn src_pending_reap_next(&mut self) -> Option<*mut u32> {
        let p = self.src();
        let (reap_hp, hp) = (p.reap_hp, p.hp);
        let next_reap_hp = self.next_offset(reap_hp);
        if next_reap_hp == hp {
            return None;
        }
        let desc = self.desc_at(next_reap_hp);
        self.src().reap_hp = next_reap_hp;
        Some(desc)
    }

    /// Walk descriptors the device has consumed since the last walk, for
    /// scrubbing their contents before reuse.
    pub(crate) fn src_get_next_consumed(&mut self) -> Option<*mut u32> {
        let p = self.src();
        let (last_cleared, cached_tp) = (p.last_cleared, p.cached_tp);
        let next = self.next_offset(last_cleared);
        if next == cached_tp {
            return None;
        }
        let desc = self.desc_at(next);
        self.src().last_cleared = next;
        Some(desc)
    }

    /// Entries consumed by the device but not yet reaped.
    pub(crate) fn src_done_val(&mut self) -> u32 {
        let (entry_size, ring_size) = (self.entry_size, self.ring_size);
        let p = self.src();
        let (reap_hp, cached_tp) = (p.reap_hp, p.cached_tp);
        let next_reap_hp = (reap_hp + entry_size) % ring_size;
        if next_reap_hp == cached_tp {
            0
        } else if cached_tp > next_reap_hp {
            (cached_tp - next_reap_hp) / entry_size
        } else {
            (ring_size - next_reap_hp + cached_tp) / entry_size
        }
    }

    /// Free entries, minus the one slot reserved to tell full from empty.
    pub(crate) fn src_num_avail(&mut self, sync: bool) -> u32 {
        if sync {
            let tp = self.read_hw_ptr();
            self.src().cached_tp = tp;
        }
        let (entry_size, ring_size) = (self.entry_size, self.ring_size);
        let p = self.src();
        let (hp, tp) = (p.hp, p.cached_tp);
        if tp > hp {
            (tp - hp) / entry_size - 1
        } else {
            (ring_size - hp + tp) / entry_size - 1
        }
    }

    pub(crate) fn src_set_hp_idx(&mut self, idx: u16) {
        let offset = idx as u32 * self.entry_size;
        self.src().hp = offset;
    }

    pub(crate) fn src_tp_idx(&self) -> u16 {
        (self.read_hw_ptr() / self.entry_size) as u16
    }

    // Destination ring index arithmetic.

    pub(crate) fn dst_get_next(&mut self) -> Option<*mut u32> {
        let p = self.dst();
        let (tp, cached_hp) = (p.tp, p.cached_hp);
        if tp == cached_hp {
            return None;
        }
        let desc = self.desc_at(tp);
        let mut next_tp = tp + self.entry_size;
        if next_tp == self.ring_size {
            next_tp = 0;
        }
        self.dst().tp = next_tp;
        if self.flags.cached_desc() {
            let entry_size = self.entry_size as usize;
            let desc_next = self.desc_at(next_tp);
            // SAFETY: `desc_next` addresses one whole entry inside the ring.
            dma_inv_range(desc_next, unsafe { desc_next.add(entry_size) });
            prefetch(desc_next);
        }
        Some(desc)
    }

    /// Like [dst_get_next](Self::dst_get_next), but only prefetches the
    /// following descriptor without any cache maintenance.
    pub(crate) fn dst_get_next_cached(&mut self) -> Option<*mut u32> {
        let p = self.dst();
        let (tp, cached_hp) = (p.tp, p.cached_hp);
        if tp == cached_hp {
            return None;
        }
        let desc = self.desc_at(tp);
        let mut next_tp = tp + self.entry_size;
        if next_tp == self.ring_size {
            next_tp = 0;
        }
        self.dst().tp = next_tp;
        prefetch(self.desc_at(next_tp));
        Some(desc)
    }

    /// Advance `cached_hp` instead of `tp`: lookahead processing of entries
    /// without releasing them back to the device.
    pub(crate) fn dst_get_next_hp(&mut self) -> Option<*mut u32> {
        let p = self.dst();
        let (tp, cached_hp) = (p.tp, p.cached_hp);
        let next_hp = self.next_offset(cached_hp);
        if next_hp == tp {
            return None;
        }
        let desc = self.desc_at(cached_hp);
        self.dst().cached_hp = next_hp;
        Some(desc)
    }

    pub(crate) fn dst_peek(&mut self) -> Option<*mut u32> {
        let p = self.dst();
        let (tp, cached_hp) = (p.tp, p.cached_hp);
        if tp == cached_hp {
            return None;
        }
        Some(self.desc_at(tp))
    }

    pub(crate) fn dst_peek_sync(&mut self) -> Option<*mut u32> {
        self.sync_cached_ptr();
        self.dst_peek()
    }

    /// Back `tp` out by one entry.
    pub(crate) fn dst_dec_tp(&mut self) {
        let (entry_size, ring_size) = (self.entry_size, self.ring_size);
        let p = self.dst();
        p.tp = if p.tp == 0 {
            ring_size - entry_size
        } else {
            p.tp - entry_size
        };
    }

    pub(crate) fn dst_num_valid(&mut self, sync: bool) -> u32 {
        if sync {
            let hp = self.read_hw_ptr();
            self.dst().cached_hp = hp;
        }
        let (entry_size, ring_size) = (self.entry_size, self.ring_size);
        let p = self.dst();
        let (hp, tp) = (p.cached_hp, p.tp);
        if hp >= tp {
            (hp - tp) / entry_size
        } else {
            (ring_size - tp + hp) / entry_size
        }
    }

    /// Invalidate `entry_count` descriptors starting at `tp`, split at the
    /// ring wrap.
    pub(crate) fn dst_invalidate_cached(&mut self, entry_count: u32) {
        if !self.flags.cached_desc() || entry_count == 0 {
            return;
        }
        let tp = self.dst().tp;
        let first = self.desc_at(tp);
        let last_index = (tp + entry_count * self.entry_size) % self.ring_size;
        let last = self.desc_at(last_index);
        if last > first {
            dma_inv_range(first, last);
        } else {
            dma_inv_range(first, self.ring_end());
            dma_inv_range(self.base, last);
        }
    }

    pub(crate) fn dst_set_tp_idx(&mut self, idx: u16) {
        let offset = idx as u32 * self.entry_size;
        self.dst().tp = offset;
    }

    pub(crate) fn dst_hp_idx(&self) -> u16 {
        (self.read_hw_ptr() / self.entry_size) as u16
    }

    /// Invalidate + prefetch the next descriptor when the ring runs in
    /// cached-descriptor mode.
    pub(crate) fn dst_prime_cached_desc(&mut self) {
        if !self.flags.cached_desc() {
            return;
        }
        let entry_size = self.entry_size as usize;
        if let Some(desc) = self.dst_peek() {
            // SAFETY: `desc` addresses one whole entry inside the ring.
            dma_inv_range(desc, unsafe { desc.add(entry_size) });
            prefetch(desc);
        }
    }

    /// Host-owned pointer value to publish on access end.
    pub(crate) fn committed_ptr(&self) -> u32 {
        match &self.ptrs {
            RingPtrs::Src(p) => p.hp,
            RingPtrs::Dst(p) => p.tp,
        }
    }

    /// Occupied entries from the host's point of view, for usage accounting.
    pub(crate) fn fill_level(&mut self) -> u32 {
        match &self.ptrs {
            RingPtrs::Src(_) => {
                let avail = self.src_num_avail(false);
                self.num_entries - avail
            }
            RingPtrs::Dst(_) => self.dst_num_valid(false),
        }
    }

    pub(crate) fn usage_percent(&mut self) -> u32 {
        if self.num_entries == 0 {
            return 0;
        }
        100 * self.fill_level() / self.num_entries
    }

    pub(crate) fn reset_watermark(&mut self, num_entries: u32) {
        self.high_wm.clear();
        self.high_wm.set_thresholds(num_entries);
    }
}

/// One arena slot: the lock-protected ring state plus everything timer
/// contexts touch without the lock.
pub(crate) struct Srng {
    pub(crate) state: Mutex<SrngState>,
    pub(crate) event: AtomicU32,
    pub(crate) initialized: AtomicBool,
    /// Mirror of the doorbell register offset for lock-free pending flushes;
    /// `u32::MAX` when the ring has no register doorbell.
    pub(crate) db_offset: AtomicU32,
    pub(crate) pending: PendingDoorbell,
    pub(crate) flush_count: AtomicU32,
    pub(crate) flush_fail: AtomicU32,
    pub(crate) flush_skipped: AtomicU32,
    pub(crate) last_flush: AtomicU64,
}
// SAFETY: the raw pointers inside `state` refer to caller-guaranteed
// device-shared memory; all mutable state is behind the spin lock or atomic.
unsafe impl Send for Srng {}
unsafe impl Sync for Srng {}

impl Srng {
    pub(crate) const fn unbound() -> Self {
        Self {
            state: Mutex::new(SrngState::unbound()),
            event: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            db_offset: AtomicU32::new(u32::MAX),
            pending: PendingDoorbell::new(),
            flush_count: AtomicU32::new(0),
            flush_fail: AtomicU32::new(0),
            flush_skipped: AtomicU32::new(0),
            last_flush: AtomicU64::new(0),
        }
    }
    pub(crate) fn set_event(&self, event: u32) {
        self.event.fetch_or(event, Ordering::Release);
    }
    pub(crate) fn clear_event(&self, event: u32) {
        self.event.fetch_and(!event, Ordering::Release);
    }
    pub(crate) fn take_event(&self, event: u32) -> bool {
        self.event.fetch_and(!event, Ordering::AcqRel) & event != 0
    }
    pub(crate) fn record_flush(&self, now: Instant) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.last_flush.store(now.as_ticks(), Ordering::Relaxed);
    }
}

/// Read-only statistics snapshot for one ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub ring_id: u8,
    pub usage_percent: u32,
    pub high_wm: u32,
    pub high_wm_timestamp: u64,
    pub wm_bins: [u32; WM_BINS],
    pub flush_count: u32,
    pub flush_fail: u32,
    pub flush_skipped: u32,
    pub last_flush_ticks: u64,
    pub doorbell_pending: bool,
}

/// Host-side view of a ring's head/tail pair, in 32-bit word offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingPointerPair {
    pub head: u32,
    pub tail: u32,
}

/// A handle to one ring of the [Hal] arena.
///
/// The `Dir` marker makes misdirected operations a compile error: only
/// [SrcRing] exposes producer brackets, only [DstRing] exposes consumer
/// brackets.
pub struct RingHandle<'h, B: DeviceIo, Dir> {
    pub(crate) hal: &'h Hal<B>,
    pub(crate) srng: &'h Srng,
    pub(crate) ring_id: u8,
    pub(crate) _dir: PhantomData<Dir>,
}

pub type SrcRing<'h, B> = RingHandle<'h, B, Src>;
pub type DstRing<'h, B> = RingHandle<'h, B, Dst>;

impl<'h, B: DeviceIo, Dir> core::fmt::Debug for RingHandle<'h, B, Dir> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingHandle")
            .field("ring_id", &self.ring_id)
            .finish()
    }
}

impl<'h, B: DeviceIo, Dir> RingHandle<'h, B, Dir> {
    pub fn ring_id(&self) -> u8 {
        self.ring_id
    }
    pub fn num_entries(&self) -> u32 {
        self.srng.state.lock().num_entries
    }
    /// Size of one ring entry in bytes.
    pub fn entry_size_bytes(&self) -> u32 {
        self.srng.state.lock().entry_size << 2
    }
    /// Low-water interrupt threshold configured at setup.
    pub fn low_threshold(&self) -> u32 {
        self.srng.state.lock().low_threshold
    }
    pub fn set_event(&self, event: u32) {
        self.srng.set_event(event);
    }
    pub fn clear_event(&self, event: u32) {
        self.srng.clear_event(event);
    }
    /// Clear the event and report whether it was set.
    pub fn take_event(&self, event: u32) -> bool {
        self.srng.take_event(event)
    }

    /// Non-blocking doorbell flush for timer contexts.
    ///
    /// Tries the ring lock; on contention it marks [FLUSH_EVENT] so the next
    /// committing access bracket performs the write, and reports
    /// [HalError::Busy]. Never blocks.
    pub fn try_flush_pending(&self) -> HalResult<()> {
        match self.srng.state.try_lock() {
            Some(_state) => self.hal.flush_pending(self.srng),
            None => {
                self.srng.set_event(FLUSH_EVENT);
                self.srng.flush_skipped.fetch_add(1, Ordering::Relaxed);
                Err(HalError::Busy)
            }
        }
    }

    /// Blocking doorbell flush.
    pub fn flush_pending(&self) -> HalResult<()> {
        let _state = self.srng.state.lock();
        self.hal.flush_pending(self.srng)
    }

    /// Host-view head/tail pair.
    pub fn sw_ptrs(&self) -> RingPointerPair {
        let state = self.srng.state.lock();
        match &state.ptrs {
            RingPtrs::Src(p) => RingPointerPair {
                head: p.hp,
                tail: state.read_hw_ptr(),
            },
            RingPtrs::Dst(p) => RingPointerPair {
                head: state.read_hw_ptr(),
                tail: p.tp,
            },
        }
    }

    pub fn usage_percent(&self) -> u32 {
        self.srng.state.lock().usage_percent()
    }

    /// Snapshot of the ring statistics, taken under the ring lock.
    pub fn stats(&self) -> RingStats {
        let mut state = self.srng.state.lock();
        RingStats {
            ring_id: self.ring_id,
            usage_percent: state.usage_percent(),
            high_wm: state.high_wm.val,
            high_wm_timestamp: state.high_wm.timestamp,
            wm_bins: state.high_wm.bins,
            flush_count: self.srng.flush_count.load(Ordering::Relaxed),
            flush_fail: self.srng.flush_fail.load(Ordering::Relaxed),
            flush_skipped: self.srng.flush_skipped.load(Ordering::Relaxed),
            last_flush_ticks: self.srng.last_flush.load(Ordering::Relaxed),
            doorbell_pending: self.srng.pending.is_dirty(),
        }
    }

    /// Reset the watermark histogram. Takes the ring lock, so this must not
    /// be called from inside an access bracket.
    pub fn clear_watermark(&self) {
        self.srng.state.lock().high_wm.clear();
    }

    /// Dump ring status through the logging backend.
    pub fn dump(&self) {
        let stats = self.stats();
        debug!(
            "ring {}: usage {}% high wm {} flushes {} (failed {} skipped {})",
            stats.ring_id,
            stats.usage_percent,
            stats.high_wm,
            stats.flush_count,
            stats.flush_fail,
            stats.flush_skipped,
        );
    }
}

impl<'h, B: DeviceIo> SrcRing<'h, B> {
    /// Start a locked producer access bracket. Blocks on the ring lock, then
    /// refreshes the cached tail pointer from the device-updated word.
    pub fn access_start(&self) -> SrcAccess<'_, 'h, B> {
        let mut state = self.srng.state.lock();
        state.sync_cached_ptr();
        AccessGuard { ring: self, state }
    }
    /// Like [access_start](Self::access_start), but fails with
    /// [HalError::Busy] instead of blocking. For timer callbacks and other
    /// contexts that must not stall.
    pub fn try_access_start(&self) -> HalResult<SrcAccess<'_, 'h, B>> {
        let mut state = self.srng.state.try_lock().ok_or(HalError::Busy)?;
        state.sync_cached_ptr();
        Ok(AccessGuard { ring: self, state })
    }
    /// Free entries without entering an access bracket.
    pub fn num_avail(&self, sync: bool) -> u32 {
        self.srng.state.lock().src_num_avail(sync)
    }
}

impl<'h, B: DeviceIo> DstRing<'h, B> {
    /// Start a locked consumer access bracket. Refreshes the cached head
    /// pointer; in cached-descriptor mode also invalidates and prefetches
    /// the next descriptor.
    pub fn access_start(&self) -> DstAccess<'_, 'h, B> {
        let mut state = self.srng.state.lock();
        state.sync_cached_ptr();
        state.dst_prime_cached_desc();
        AccessGuard { ring: self, state }
    }
    /// Non-blocking variant of [access_start](Self::access_start).
    pub fn try_access_start(&self) -> HalResult<DstAccess<'_, 'h, B>> {
        let mut state = self.srng.state.try_lock().ok_or(HalError::Busy)?;
        state.sync_cached_ptr();
        state.dst_prime_cached_desc();
        Ok(AccessGuard { ring: self, state })
    }
    /// Unread entries without entering an access bracket.
    pub fn num_valid(&self, sync: bool) -> u32 {
        self.srng.state.lock().dst_num_valid(sync)
    }
    /// Peek under the ring lock with a head-pointer resync, without an
    /// access bracket. Returns whether an entry is waiting.
    pub fn peek_sync_locked(&self) -> bool {
        self.srng.state.lock().dst_peek_sync().is_some()
    }
}

/// An access bracket on a ring: created by `access_start`, holds the ring
/// lock, and is the only context in which ring indices move.
///
/// Ending the bracket decides what the device learns:
/// - [end](SrcAccess::end) publishes the host pointer and rings the doorbell,
/// - [end_deferred](SrcAccess::end_deferred) queues the pointer for a later
///   coalesced doorbell,
/// - [end_reap](Self::end_reap) publishes nothing.
///
/// Dropping the guard without calling one of these releases the lock and
/// publishes nothing, like [end_reap](Self::end_reap) minus the
/// deferred-flush check.
pub struct AccessGuard<'a, 'h, B: DeviceIo, Dir> {
    ring: &'a RingHandle<'h, B, Dir>,
    state: MutexGuard<'a, SrngState>,
}

pub type SrcAccess<'a, 'h, B> = AccessGuard<'a, 'h, B, Src>;
pub type DstAccess<'a, 'h, B> = AccessGuard<'a, 'h, B, Dst>;

impl<'a, 'h, B: DeviceIo, Dir> AccessGuard<'a, 'h, B, Dir> {
    /// Re-read the device-updated pointer word mid-bracket.
    pub fn resync(&mut self) {
        self.state.sync_cached_ptr();
    }

    /// End the bracket without publishing the host pointer. Used after pure
    /// reap passes where the device is owed no update. A flush deferred by a
    /// busy timer context is still honored here.
    pub fn end_reap(self) {
        if self.ring.srng.take_event(FLUSH_EVENT) {
            let _ = self.ring.hal.flush_pending(self.ring.srng);
        }
    }

    fn commit(&mut self, flush: bool) -> HalResult<()> {
        let now = Instant::now();
        let fill = self.state.fill_level();
        self.state.high_wm.update(fill, now.as_ticks());
        self.ring.srng.clear_event(FLUSH_EVENT);
        let value = self.state.committed_ptr();
        match self.state.doorbell {
            Doorbell::None => Ok(()),
            Doorbell::Memory(hw_ptr) => {
                let raw = if self.state.flags.ptr_le() {
                    value.to_le()
                } else {
                    value
                };
                // SAFETY: FW-shared pointer word supplied at setup.
                unsafe { ptr::write_volatile(hw_ptr, raw) };
                self.ring.srng.record_flush(now);
                Ok(())
            }
            Doorbell::Register(offset) => {
                if flush {
                    self.ring
                        .hal
                        .doorbell_write(self.ring.srng, offset, value, now)
                } else {
                    self.ring.hal.doorbell_queue(self.ring.srng, value, now);
                    Ok(())
                }
            }
        }
    }
}

impl<'a, 'h, B: DeviceIo> SrcAccess<'a, 'h, B> {
    /// Descriptor slot at `hp`, advancing `hp` (and the pinned `reap_hp`).
    /// `None` when only the reserved empty slot is left.
    pub fn get_next(&mut self) -> Option<&mut [u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.src_get_next()?;
        // SAFETY: `desc` addresses one whole entry inside the ring region
        // and the bracket holds the ring lock.
        Some(unsafe { slice::from_raw_parts_mut(desc, entry_size) })
    }
    /// The slot `get_next` would return, without advancing.
    pub fn peek(&mut self) -> Option<&mut [u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.src_peek()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts_mut(desc, entry_size) })
    }
    /// Lookahead two entries past `hp` without advancing.
    pub fn peek_next2(&mut self) -> Option<&mut [u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.src_peek_next2()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts_mut(desc, entry_size) })
    }
    /// Current `hp` slot, advancing only if the ring has room. Init-time
    /// replenish only.
    pub fn get_cur_and_move(&mut self) -> &mut [u32] {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.src_get_cur_and_move();
        // SAFETY: as in `get_next`.
        unsafe { slice::from_raw_parts_mut(desc, entry_size) }
    }
    /// Next device-consumed entry for buffer reclamation; advances
    /// `reap_hp`.
    pub fn reap_next(&mut self) -> Option<&[u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.src_reap_next()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts(desc, entry_size) })
    }
    /// Post into a previously reaped slot; `hp` never passes `reap_hp`.
    pub fn get_next_reaped(&mut self) -> Option<&mut [u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.src_get_next_reaped()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts_mut(desc, entry_size) })
    }
    /// Detach-path reap of entries posted but never completed.
    pub fn pending_reap_next(&mut self) -> Option<&[u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.src_pending_reap_next()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts(desc, entry_size) })
    }
    /// Next descriptor the device has consumed since the last call, for
    /// scrubbing slot contents.
    pub fn get_next_consumed(&mut self) -> Option<&mut [u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.src_get_next_consumed()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts_mut(desc, entry_size) })
    }
    /// Entries completed by the device but not yet reaped.
    pub fn done_val(&mut self) -> u32 {
        self.state.src_done_val()
    }
    /// Free entries, optionally resyncing the cached tail first.
    pub fn num_avail(&mut self, sync: bool) -> u32 {
        self.state.src_num_avail(sync)
    }
    /// Override `hp` by entry index. Init-time use only.
    pub fn set_hp_idx(&mut self, idx: u16) {
        self.state.src_set_hp_idx(idx);
    }
    /// Device tail pointer in entry units.
    pub fn tp_idx(&self) -> u16 {
        self.state.src_tp_idx()
    }

    /// Publish `hp` and ring the doorbell now.
    pub fn end(mut self) -> HalResult<()> {
        self.commit(true)
    }
    /// Publish `hp` into the pending-doorbell slot for a coalesced write
    /// later. The device is not notified yet.
    pub fn end_deferred(mut self) -> HalResult<()> {
        self.commit(false)
    }
}

impl<'a, 'h, B: DeviceIo> DstAccess<'a, 'h, B> {
    /// Descriptor at `tp`, advancing `tp`. `None` when the ring is empty.
    pub fn get_next(&mut self) -> Option<&[u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.dst_get_next()?;
        // SAFETY: `desc` addresses one whole entry inside the ring region
        // and the bracket holds the ring lock.
        Some(unsafe { slice::from_raw_parts(desc, entry_size) })
    }
    /// Like [get_next](Self::get_next) with a prefetch of the following
    /// descriptor and no cache maintenance.
    pub fn get_next_cached(&mut self) -> Option<&[u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.dst_get_next_cached()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts(desc, entry_size) })
    }
    /// Lookahead: walk `cached_hp` toward `tp` without releasing entries.
    pub fn get_next_hp(&mut self) -> Option<&[u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.dst_get_next_hp()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts(desc, entry_size) })
    }
    /// Descriptor at `tp` without advancing.
    pub fn peek(&mut self) -> Option<&[u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.dst_peek()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts(desc, entry_size) })
    }
    /// [peek](Self::peek) with a head-pointer resync first.
    pub fn peek_sync(&mut self) -> Option<&[u32]> {
        let entry_size = self.state.entry_size as usize;
        let desc = self.state.dst_peek_sync()?;
        // SAFETY: as in `get_next`.
        Some(unsafe { slice::from_raw_parts(desc, entry_size) })
    }
    /// Back `tp` out by one entry.
    pub fn dec_tp(&mut self) {
        self.state.dst_dec_tp();
    }
    /// Unread entries, optionally resyncing the cached head first.
    pub fn num_valid(&mut self, sync: bool) -> u32 {
        self.state.dst_num_valid(sync)
    }
    /// Refresh `cached_hp` from the device-updated word.
    pub fn sync_cached_hp(&mut self) {
        self.state.sync_cached_ptr();
    }
    /// Batch cache invalidate from `tp` over `entry_count` descriptors.
    pub fn invalidate_cached_descs(&mut self, entry_count: u32) {
        self.state.dst_invalidate_cached(entry_count);
    }
    /// Override `tp` by entry index. Init-time use only.
    pub fn set_tp_idx(&mut self, idx: u16) {
        self.state.dst_set_tp_idx(idx);
    }
    /// Device head pointer in entry units.
    pub fn hp_idx(&self) -> u16 {
        self.state.dst_hp_idx()
    }

    /// Publish `tp` and ring the doorbell now.
    pub fn end(mut self) -> HalResult<()> {
        self.commit(true)
    }
    /// Publish `tp` into the pending-doorbell slot for a coalesced write
    /// later.
    pub fn end_deferred(mut self) -> HalResult<()> {
        self.commit(false)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[inline(always)]
        fn prefetch(desc: *const u32) {
            // SAFETY: prefetching is a hint and has no memory effects.
            unsafe {
                core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T0 }>(
                    desc as *const i8,
                )
            }
        }
    } else {
        #[inline(always)]
        fn prefetch(_desc: *const u32) {}
    }
}

/// Cache maintenance hook for cached-descriptor rings. The targets this
/// crate runs on are DMA-coherent, so there is nothing to do; non-coherent
/// ports hook their invalidate here.
#[inline(always)]
fn dma_inv_range(_start: *const u32, _end: *const u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing memory plus a simulated device-owned pointer word.
    struct TestRing {
        mem: Vec<u32>,
        hw_ptr: Box<u32>,
    }
    impl TestRing {
        fn new(num_entries: u32, entry_size: u32) -> Self {
            Self {
                mem: vec![0u32; (num_entries * entry_size) as usize],
                hw_ptr: Box::new(0),
            }
        }
        fn state(&mut self, dir: SrngDir, num_entries: u32, entry_size: u32) -> SrngState {
            let mut state = SrngState::unbound();
            state.base = self.mem.as_mut_ptr();
            state.ring_size = num_entries * entry_size;
            state.num_entries = num_entries;
            state.entry_size = entry_size;
            state.hw_ptr = &*self.hw_ptr;
            state.ptrs = match dir {
                SrngDir::Source => RingPtrs::Src(SrcPtrs {
                    hp: 0,
                    reap_hp: 0,
                    cached_tp: 0,
                    last_cleared: 0,
                }),
                SrngDir::Destination => RingPtrs::Dst(DstPtrs { tp: 0, cached_hp: 0 }),
            };
            state
        }
        fn src_state(&mut self, num_entries: u32, entry_size: u32) -> SrngState {
            self.state(SrngDir::Source, num_entries, entry_size)
        }
        fn dst_state(&mut self, num_entries: u32, entry_size: u32) -> SrngState {
            self.state(SrngDir::Destination, num_entries, entry_size)
        }
        fn set_hw_ptr(&mut self, value: u32) {
            *self.hw_ptr = value;
        }
    }

    #[test]
    fn src_empty_ring_reserves_one_slot() {
        let mut ring = TestRing::new(4, 2);
        let mut state = ring.src_state(4, 2);
        // A fresh ring has num_entries - 1 usable slots.
        assert_eq!(state.src_num_avail(false), 3);
        for _ in 0..3 {
            assert!(state.src_get_next().is_some());
        }
        assert_eq!(state.src_num_avail(false), 0);
        // The reserved slot keeps full distinguishable from empty.
        assert!(state.src_get_next().is_none());
    }

    #[test]
    fn src_wraps_with_non_power_of_two_entry_size() {
        let num_entries = 5;
        let entry_size = 3;
        let mut ring = TestRing::new(num_entries, entry_size);
        let mut state = ring.src_state(num_entries, entry_size);
        let ring_size = num_entries * entry_size;

        // Walk several times around the ring; the device keeps pace so the
        // ring never reports full.
        let mut expected = 0;
        for _ in 0..(3 * num_entries) {
            ring.set_hw_ptr(expected); // device consumed everything posted
            state.sync_cached_ptr();
            assert!(state.src_get_next().is_some());
            expected = (expected + entry_size) % ring_size;
            let RingPtrs::Src(p) = &state.ptrs else { unreachable!() };
            assert_eq!(p.hp, expected);
            assert!(p.hp < ring_size);
            assert_eq!(p.hp % entry_size, 0);
        }
    }

    #[test]
    fn src_reap_before_reuse() {
        let mut ring = TestRing::new(4, 1);
        let mut state = ring.src_state(4, 1);

        // Post three descriptors, ring now full.
        for _ in 0..3 {
            assert!(state.src_get_next().is_some());
        }
        assert!(state.src_get_next().is_none());

        // Device consumes two entries.
        ring.set_hw_ptr(2);
        state.sync_cached_ptr();

        // Nothing can be posted through the reaped path before reaping.
        assert!(state.src_get_next_reaped().is_none());

        // Reap one entry; exactly one posting slot opens up, and hp stops at
        // reap_hp again afterwards.
        assert!(state.src_reap_next().is_some());
        assert!(state.src_get_next_reaped().is_some());
        assert!(state.src_get_next_reaped().is_none());

        let RingPtrs::Src(p) = &state.ptrs else { unreachable!() };
        assert_eq!(p.hp, p.reap_hp);
    }

    #[test]
    fn src_done_val_counts_consumed_entries() {
        let mut ring = TestRing::new(8, 1);
        let mut state = ring.src_state(8, 1);
        for _ in 0..5 {
            assert!(state.src_get_next().is_some());
        }
        // reap_hp == hp == 5; the device's tail wrapped past 3.
        ring.set_hw_ptr(3);
        state.sync_cached_ptr();
        // Entries 6, 7, 0, 1, 2 lie between reap_hp and the tail.
        assert_eq!(state.src_done_val(), 5);
        for _ in 0..2 {
            assert!(state.src_reap_next().is_some());
        }
        assert_eq!(state.src_done_val(), 3);
    }

    #[test]
    fn src_consumed_walk_stops_at_tail() {
        let mut ring = TestRing::new(6, 1);
        let mut state = ring.src_state(6, 1);
        for _ in 0..4 {
            assert!(state.src_get_next().is_some());
        }
        ring.set_hw_ptr(3);
        state.sync_cached_ptr();
        // Entries 1 and 2 are strictly before the device tail.
        assert!(state.src_get_next_consumed().is_some());
        assert!(state.src_get_next_consumed().is_some());
        assert!(state.src_get_next_consumed().is_none());
    }

    #[test]
    fn src_peek_does_not_advance() {
        let mut ring = TestRing::new(4, 1);
        let mut state = ring.src_state(4, 1);
        let first = state.src_peek().unwrap();
        let again = state.src_peek().unwrap();
        assert_eq!(first, again);
        let taken = state.src_get_next().unwrap();
        assert_eq!(first, taken);
    }

    #[test]
    fn dst_fifo_order() {
        let entry_size = 2u32;
        let num_entries = 4u32;
        let mut ring = TestRing::new(num_entries, entry_size);
        // The simulated device writes tagged descriptors and mirrors hp.
        for (i, tag) in [0xa0u32, 0xa1, 0xa2].iter().enumerate() {
            ring.mem[i * entry_size as usize] = *tag;
        }
        ring.set_hw_ptr(3 * entry_size);
        let mut state = ring.dst_state(num_entries, entry_size);
        state.sync_cached_ptr();

        assert_eq!(state.dst_num_valid(false), 3);
        for tag in [0xa0u32, 0xa1, 0xa2] {
            let desc = state.dst_get_next().unwrap();
            assert_eq!(unsafe { *desc }, tag);
        }
        assert!(state.dst_get_next().is_none());
        assert_eq!(state.dst_num_valid(false), 0);
    }

    #[test]
    fn dst_wraps_exactly_once_per_lap() {
        let num_entries = 7;
        let entry_size = 3;
        let mut ring = TestRing::new(num_entries, entry_size);
        let mut state = ring.dst_state(num_entries, entry_size);
        let ring_size = num_entries * entry_size;

        let mut device_hp = 0;
        for lap in 0..2 {
            for _ in 0..num_entries {
                device_hp = (device_hp + entry_size) % ring_size;
                ring.set_hw_ptr(device_hp);
                state.sync_cached_ptr();
                assert!(state.dst_get_next().is_some());
                let RingPtrs::Dst(p) = &state.ptrs else { unreachable!() };
                assert!(p.tp < ring_size);
                assert_eq!(p.tp % entry_size, 0);
            }
            // A whole lap returns tp to its starting offset.
            let RingPtrs::Dst(p) = &state.ptrs else { unreachable!() };
            assert_eq!(p.tp, 0, "lap {lap}");
        }
    }

    #[test]
    fn dst_dec_tp_backs_out_one_entry() {
        let mut ring = TestRing::new(4, 2);
        ring.set_hw_ptr(4);
        let mut state = ring.dst_state(4, 2);
        state.sync_cached_ptr();
        assert!(state.dst_get_next().is_some());
        state.dst_dec_tp();
        let RingPtrs::Dst(p) = &state.ptrs else { unreachable!() };
        assert_eq!(p.tp, 0);
        // Wraps backwards from offset zero.
        state.dst_dec_tp();
        let RingPtrs::Dst(p) = &state.ptrs else { unreachable!() };
        assert_eq!(p.tp, 6);
    }

    #[test]
    fn dst_get_next_hp_is_bounded_by_tp() {
        let mut ring = TestRing::new(4, 1);
        ring.set_hw_ptr(2);
        let mut state = ring.dst_state(4, 1);
        state.sync_cached_ptr();
        // cached_hp may walk forward until the slot before tp.
        let mut lookahead = 0;
        while state.dst_get_next_hp().is_some() {
            lookahead += 1;
        }
        assert_eq!(lookahead, 1);
    }

    #[test]
    fn ptr_le_flag_converts_hw_ptr_reads() {
        let mut ring = TestRing::new(4, 1);
        let mut state = ring.src_state(4, 1);
        state.flags = SrngFlags::new().with_ptr_le(true);
        ring.set_hw_ptr(2u32.to_le());
        state.sync_cached_ptr();
        let RingPtrs::Src(p) = &state.ptrs else { unreachable!() };
        assert_eq!(p.cached_tp, 2);
    }

    #[test]
    fn watermark_binning() {
        let mut wm = HighWatermark::new();
        wm.set_thresholds(100);
        wm.update(10, 1);
        wm.update(55, 2);
        wm.update(95, 3);
        wm.update(60, 4);
        assert_eq!(wm.val, 95);
        assert_eq!(wm.timestamp, 3);
        assert_eq!(wm.bins, [1, 1, 1, 0, 0, 1]);
        wm.clear();
        assert_eq!(wm.bins, [0; WM_BINS]);
        assert_eq!(wm.val, 0);
    }

    #[test]
    fn usage_percent_tracks_fill() {
        let mut ring = TestRing::new(8, 1);
        let mut state = ring.dst_state(8, 1);
        assert_eq!(state.usage_percent(), 0);
        ring.set_hw_ptr(4);
        state.sync_cached_ptr();
        assert_eq!(state.usage_percent(), 50);
    }
}
