use core::{cell::Cell, marker::PhantomData, ptr};

use embassy_sync::blocking_mutex;
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    reg::{DeviceCaps, DeviceIo, RegStats, ShadowRegConfig, MAX_SHADOW_REGS, WINDOW_UNSET},
    srng::{
        Doorbell, DstPtrs, DstRing, RingHandle, RingPointerPair, RingPtrs, SrcPtrs, SrcRing,
        Srng, SrngDir, SrngParams, MAX_RINGS,
    },
    DefaultRawMutex,
};

/// Errors reported by the HAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HalError {
    /// Ring slot already bound, ring memory unusable, or the ring was not
    /// idle at setup.
    RingUnavailable,
    /// A non-blocking lock acquisition found the resource held.
    Busy,
    /// A bounded poll ran out of attempts.
    Timeout,
    /// A confirmed register write kept reading back a different value.
    WriteMismatch,
    /// Capability or shadow-register configuration is inconsistent.
    InvalidConfig,
    /// The self-recovery hook was invoked and the operation aborted.
    RecoveryTriggered,
}

pub type HalResult<T> = Result<T, HalError>;

/// Generic per-ring register block layout, relative to the ring's
/// `hwreg_base`.
const REG_RING_BASE_LSB: u32 = 0x00;
const REG_RING_BASE_MSB: u32 = 0x04;
const REG_RING_SIZE: u32 = 0x08;
const REG_RING_HP: u32 = 0x0C;
const REG_RING_TP: u32 = 0x10;
const REG_RING_LOW_THRESH: u32 = 0x14;

/// Shared pointer memory supplied by the bus/device collaborator at attach
/// time.
///
/// `shadow_rdptr_mem` is where the device publishes its ring pointers (the
/// tail of source rings, the head of destination rings); `shadow_wrptr_mem`
/// is where the host publishes pointer updates for FW-managed (LMAC) rings.
/// Both are arrays of one 32-bit word per ring id.
#[derive(Clone, Copy, Debug)]
pub struct HalMemInfo {
    pub shadow_rdptr_mem: *mut u32,
    pub shadow_wrptr_mem: *mut u32,
}
impl HalMemInfo {
    /// A memory map with no shared pointer words. Only valid for a [Hal]
    /// that never sets up rings (register-access-only use and tests).
    pub const fn empty() -> Self {
        Self {
            shadow_rdptr_mem: ptr::null_mut(),
            shadow_wrptr_mem: ptr::null_mut(),
        }
    }
}

pub(crate) struct SharedPtrMem {
    pub(crate) rdptr: *mut u32,
    pub(crate) wrptr: *mut u32,
}
// SAFETY: the pointers refer to device-shared memory whose validity the
// caller guaranteed at attach; every access is volatile and word-sized.
unsafe impl Send for SharedPtrMem {}
unsafe impl Sync for SharedPtrMem {}

/// The HAL context: register accessor state plus the ring arena.
///
/// One instance per device, owning the injected bus collaborator. Per-SoC
/// behavior differences arrive here at attach time through [DeviceCaps];
/// nothing is selected at compile time.
pub struct Hal<B: DeviceIo> {
    pub(crate) bus: B,
    pub(crate) caps: DeviceCaps,
    pub(crate) init_phase: AtomicBool,
    /// Currently selected remap window bank. Narrow lock: held only across a
    /// single windowed register access, never across a ring bracket.
    pub(crate) window: blocking_mutex::Mutex<DefaultRawMutex, Cell<u32>>,
    pub(crate) shadow_cfg: [Option<ShadowRegConfig>; MAX_SHADOW_REGS],
    pub(crate) reg_stats: RegStats,
    pub(crate) rings: [Srng; MAX_RINGS],
    pub(crate) mem: SharedPtrMem,
}

impl<B: DeviceIo> Hal<B> {
    /// Initialize the HAL layer for one device.
    ///
    /// Starts in the init phase (no wake handshakes) until
    /// [set_init_phase](Self::set_init_phase)`(false)` declares the datapath
    /// rings live.
    ///
    /// SAFETY:
    /// The memory behind `mem` must stay valid and device-coherent for the
    /// lifetime of the returned [Hal], with at least one word per ring id
    /// that will be set up.
    pub unsafe fn attach(
        bus: B,
        caps: DeviceCaps,
        mem: HalMemInfo,
        shadow: &[ShadowRegConfig],
    ) -> HalResult<Self> {
        if caps.use_register_windowing && caps.window_start != 1 << caps.window_shift {
            return Err(HalError::InvalidConfig);
        }
        if shadow.len() > MAX_SHADOW_REGS {
            return Err(HalError::InvalidConfig);
        }
        let mut shadow_cfg = [None; MAX_SHADOW_REGS];
        for (slot, config) in shadow_cfg.iter_mut().zip(shadow) {
            *slot = Some(*config);
        }
        // Each target register may be mapped at most once.
        for (i, a) in shadow.iter().enumerate() {
            if shadow[..i]
                .iter()
                .any(|b| b.target_register == a.target_register)
            {
                return Err(HalError::InvalidConfig);
            }
        }

        #[allow(clippy::declare_interior_mutable_const)]
        const UNBOUND: Srng = Srng::unbound();
        let hal = Self {
            bus,
            caps,
            init_phase: AtomicBool::new(true),
            window: blocking_mutex::Mutex::new(Cell::new(WINDOW_UNSET)),
            shadow_cfg,
            reg_stats: RegStats::new(),
            rings: [UNBOUND; MAX_RINGS],
            mem: SharedPtrMem {
                rdptr: mem.shadow_rdptr_mem,
                wrptr: mem.shadow_wrptr_mem,
            },
        };
        trace!("HAL attached, {} ring slots", MAX_RINGS);
        Ok(hal)
    }

    /// The injected bus collaborator.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn validate_params(params: &SrngParams) -> HalResult<()> {
        if params.ring_id as usize >= MAX_RINGS
            || params.num_entries < 2
            || params.entry_size == 0
        {
            return Err(HalError::RingUnavailable);
        }
        let ring_bytes = params.num_entries as usize * params.entry_size as usize * 4;
        if ring_bytes > params.ring_len_bytes {
            return Err(HalError::RingUnavailable);
        }
        if params.ring_base_vaddr.is_null() || params.ring_base_vaddr as usize % 8 != 0 {
            return Err(HalError::RingUnavailable);
        }
        Ok(())
    }

    /// Initialize a ring: bind the arena slot, program the ring's register
    /// block and reset all pointers.
    fn setup_ring(
        &self,
        params: &SrngParams,
        dir: SrngDir,
        idle_check: bool,
    ) -> HalResult<&Srng> {
        Self::validate_params(params)?;
        let srng = &self.rings[params.ring_id as usize];
        if srng
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Already bound.
            return Err(HalError::RingUnavailable);
        }

        let result = self.setup_ring_bound(srng, params, dir, idle_check);
        if let Err(err) = result {
            srng.initialized.store(false, Ordering::Release);
            return Err(err);
        }
        trace!(
            "ring {} set up: {} entries of {} words",
            params.ring_id,
            params.num_entries,
            params.entry_size
        );
        Ok(srng)
    }

    fn setup_ring_bound(
        &self,
        srng: &Srng,
        params: &SrngParams,
        dir: SrngDir,
        idle_check: bool,
    ) -> HalResult<()> {
        if idle_check {
            let hp = self.read32(params.hwreg_base + REG_RING_HP)?;
            let tp = self.read32(params.hwreg_base + REG_RING_TP)?;
            if hp != 0 || tp != 0 {
                warn!("ring {} not idle (hp {:#x} tp {:#x})", params.ring_id, hp, tp);
                return Err(HalError::RingUnavailable);
            }
        }

        // SAFETY: attach guaranteed one pointer word per ring id.
        let rdptr = unsafe { self.mem.rdptr.add(params.ring_id as usize) };
        // SAFETY: same as above; clear the device-updated word before the
        // ring goes live.
        unsafe { ptr::write_volatile(rdptr, 0) };

        let doorbell = if params.flags.lmac_ring() {
            // SAFETY: same as above.
            let wrptr = unsafe { self.mem.wrptr.add(params.ring_id as usize) };
            unsafe { ptr::write_volatile(wrptr, 0) };
            Doorbell::Memory(wrptr)
        } else {
            let offset = params.hwreg_base
                + match dir {
                    SrngDir::Source => REG_RING_HP,
                    SrngDir::Destination => REG_RING_TP,
                };
            srng.db_offset.store(offset, Ordering::Release);
            Doorbell::Register(offset)
        };

        // Program the ring's register block. During bring-up this runs in
        // the init phase, so no wake handshakes are involved.
        let ring_size = params.num_entries * params.entry_size;
        self.write32(
            params.hwreg_base + REG_RING_BASE_LSB,
            params.ring_base_paddr as u32,
        )?;
        self.write32(
            params.hwreg_base + REG_RING_BASE_MSB,
            (params.ring_base_paddr >> 32) as u32,
        )?;
        self.write32(params.hwreg_base + REG_RING_SIZE, ring_size)?;
        if matches!(dir, SrngDir::Source) {
            self.write32(params.hwreg_base + REG_RING_LOW_THRESH, params.low_threshold)?;
        }
        self.write32(params.hwreg_base + REG_RING_HP, 0)?;
        self.write32(params.hwreg_base + REG_RING_TP, 0)?;

        let mut state = srng.state.lock();
        state.base = params.ring_base_vaddr;
        state.ring_size = ring_size;
        state.num_entries = params.num_entries;
        state.entry_size = params.entry_size;
        state.flags = params.flags;
        state.low_threshold = params.low_threshold;
        state.hwreg_base = params.hwreg_base;
        state.hw_ptr = rdptr;
        state.doorbell = doorbell;
        state.ptrs = match dir {
            SrngDir::Source => RingPtrs::Src(SrcPtrs {
                hp: 0,
                reap_hp: 0,
                cached_tp: 0,
                last_cleared: 0,
            }),
            SrngDir::Destination => RingPtrs::Dst(DstPtrs { tp: 0, cached_hp: 0 }),
        };
        state.reset_watermark(params.num_entries);
        Ok(())
    }

    /// Set up a source (host-produces) ring.
    ///
    /// SAFETY:
    /// `params.ring_base_vaddr` must point at `params.ring_len_bytes` bytes
    /// of device-shared ring memory, valid and unaliased for the lifetime of
    /// the returned handle.
    pub unsafe fn setup_src_ring(
        &self,
        params: SrngParams,
        idle_check: bool,
    ) -> HalResult<SrcRing<'_, B>> {
        let srng = self.setup_ring(&params, SrngDir::Source, idle_check)?;
        Ok(RingHandle {
            hal: self,
            srng,
            ring_id: params.ring_id,
            _dir: PhantomData,
        })
    }

    /// Set up a destination (device-produces) ring.
    ///
    /// SAFETY:
    /// As for [setup_src_ring](Self::setup_src_ring).
    pub unsafe fn setup_dst_ring(
        &self,
        params: SrngParams,
        idle_check: bool,
    ) -> HalResult<DstRing<'_, B>> {
        let srng = self.setup_ring(&params, SrngDir::Destination, idle_check)?;
        Ok(RingHandle {
            hal: self,
            srng,
            ring_id: params.ring_id,
            _dir: PhantomData,
        })
    }

    /// Tear a ring down and release its arena slot.
    pub fn srng_cleanup<Dir>(&self, ring: RingHandle<'_, B, Dir>) {
        let srng = ring.srng;
        {
            let mut state = srng.state.lock();
            let _ = srng.pending.take();
            // Disable the ring on the device side.
            let _ = self.write32(state.hwreg_base + REG_RING_SIZE, 0);
            *state = crate::srng::SrngState::unbound();
        }
        srng.db_offset.store(u32::MAX, Ordering::Release);
        srng.event.store(0, Ordering::Release);
        srng.initialized.store(false, Ordering::Release);
        trace!("ring {} cleaned up", ring.ring_id);
    }

    /// Dump per-ring statistics through the logging backend.
    pub fn dump_srng_stats(&self) {
        for (ring_id, srng) in self.rings.iter().enumerate() {
            if !srng.initialized.load(Ordering::Acquire) {
                continue;
            }
            let mut state = srng.state.lock();
            debug!(
                "ring {}: usage {}% high wm {} flushes {} (failed {} skipped {}) pending {}",
                ring_id,
                state.usage_percent(),
                state.high_wm.val,
                srng.flush_count.load(Ordering::Relaxed),
                srng.flush_fail.load(Ordering::Relaxed),
                srng.flush_skipped.load(Ordering::Relaxed),
                srng.pending.is_dirty(),
            );
        }
    }

    /// Dump register accessor statistics through the logging backend.
    pub fn dump_reg_write_stats(&self) {
        let stats = self.reg_stats();
        let delayed = self.delayed_write_stats();
        debug!(
            "reg writes: {} confirm failures, shadow {} ok / {} failed, {} wake failures, {} doorbells pending",
            stats.reg_write_fail,
            stats.shadow_write_succ,
            stats.shadow_write_fail,
            stats.wake_fail,
            delayed.pending,
        );
    }
}

impl<'h, B: DeviceIo, Dir> RingHandle<'h, B, Dir> {
    /// Device-view head/tail pair, read back from the ring's pointer
    /// registers.
    pub fn hw_ptrs(&self) -> HalResult<RingPointerPair> {
        let hwreg_base = self.srng.state.lock().hwreg_base;
        Ok(RingPointerPair {
            head: self.hal.read32(hwreg_base + REG_RING_HP)?,
            tail: self.hal.read32(hwreg_base + REG_RING_TP)?,
        })
    }
}

impl<B: DeviceIo> Drop for Hal<B> {
    fn drop(&mut self) {
        // Forced drain: no doorbell value queued by a policy layer may
        // outlive the HAL.
        self.flush_all_doorbells();
    }
}
