use core::cell::Cell;

use embassy_time::{block_for, Duration};
use macro_bits::{bit, check_bit};
use portable_atomic::{AtomicU32, Ordering};

use crate::hal::{Hal, HalError, HalResult};

/// Window-select register: top bit enables the remap window.
pub const WINDOW_ENABLE_BIT: u32 = 0x8000_0000;
/// Sentinel for "no window selected yet", so the first windowed access always
/// programs the window register.
pub(crate) const WINDOW_UNSET: u32 = u32::MAX;

/// Max times allowed for register writing retry.
const REG_WRITE_RETRY_MAX: u32 = 5;
/// Delay for each retry.
const REG_WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Shadow config indices 1..32 map to the low dirty-bit register, 32..40 to
/// the high one.
const SHADOW_REG_INDEX_LOW: u8 = 32;
const SHADOW_REG_INDEX_HIGH: u8 = 40;
/// Max retry attempts to read the dirty bit reg.
const SHADOW_DIRTY_BIT_POLL_MAX: u32 = 2000;
/// Delay between dirty bit reg polls.
const SHADOW_DIRTY_BIT_POLL_DELAY: Duration = Duration::from_micros(5);

/// Capacity of the shadow register configuration table.
pub const MAX_SHADOW_REGS: usize = 40;

/// Why the self-recovery hook was invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryReason {
    /// A confirmed register write kept reading back wrong.
    RegWriteFailure,
    /// The device did not acknowledge a wake request.
    WakeRequestFailure,
    /// The device did not acknowledge a wake release.
    WakeReleaseFailure,
}

/// The device/bus collaborator.
///
/// `read32`/`write32` take offsets relative to the register space base; all
/// windowing, wake and shadow logic lives above this trait. The wake
/// handshake defaults model a device that is always awake, and the recovery
/// hook defaults to doing nothing.
pub trait DeviceIo {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
    /// Bring the bus/clock domain up before register access. Returns whether
    /// the device acknowledged.
    fn request_wake(&self) -> bool {
        true
    }
    /// Allow the device back into low power. Returns whether the device
    /// acknowledged.
    fn release_wake(&self) -> bool {
        true
    }
    /// Escalation hook for unrecoverable register access failures. Fire and
    /// forget; the failing operation has already been aborted.
    fn trigger_self_recovery(&self, reason: RecoveryReason) {
        let _ = reason;
    }
}

/// Per-device capabilities, fixed at attach time.
///
/// The register address space splits into three regions:
///
/// ```text
///      ALWAYS MAPPED       UNWINDOWED REGION      WINDOWED REGION
///  |-------------------|----------------------|--------------------|
/// BAR   NO FORCE WAKE  +always_mapped_off     +window_start
/// ```
///
/// Anything at or above `always_mapped_off` needs the wake handshake when
/// `use_force_wake` is set and the init phase is over. Anything at or above
/// `window_start` additionally goes through the remap window when
/// `use_register_windowing` is set.
#[derive(Clone, Copy, Debug)]
pub struct DeviceCaps {
    pub use_register_windowing: bool,
    pub use_force_wake: bool,
    /// Route confirmed writes through the shadow register file instead of the
    /// target register.
    pub shadow_regs_enabled: bool,
    pub always_mapped_off: u32,
    /// First windowed offset; must equal `1 << window_shift`.
    pub window_start: u32,
    pub window_shift: u32,
    pub window_value_mask: u32,
    /// Offset of the window-select register, inside the always-mapped region.
    pub window_reg_offset: u32,
    /// Base offset of the shadow register file.
    pub shadow_reg_base: u32,
    /// Wrapper block holding the shadow dirty-bit registers.
    pub dirty_bit_wrapper_base: u32,
    pub dirty_bit_reg_low: u32,
    pub dirty_bit_reg_high: u32,
}
impl DeviceCaps {
    pub(crate) const fn window_range_mask(&self) -> u32 {
        self.window_start - 1
    }
}
impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            use_register_windowing: true,
            use_force_wake: false,
            shadow_regs_enabled: false,
            always_mapped_off: 0xFE0,
            window_start: 1 << 19,
            window_shift: 19,
            window_value_mask: 0x3F,
            window_reg_offset: 0x310,
            shadow_reg_base: 0x8FC,
            dirty_bit_wrapper_base: 0x01E0_0000,
            dirty_bit_reg_low: 0x30C8,
            dirty_bit_reg_high: 0x30C4,
        }
    }
}

/// One `(target register -> shadow index)` mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowRegConfig {
    pub target_register: u32,
    pub shadow_config_index: u8,
}

pub(crate) struct RegStats {
    pub(crate) reg_write_fail: AtomicU32,
    pub(crate) shadow_write_succ: AtomicU32,
    pub(crate) shadow_write_fail: AtomicU32,
    pub(crate) wake_fail: AtomicU32,
}
impl RegStats {
    pub(crate) const fn new() -> Self {
        Self {
            reg_write_fail: AtomicU32::new(0),
            shadow_write_succ: AtomicU32::new(0),
            shadow_write_fail: AtomicU32::new(0),
            wake_fail: AtomicU32::new(0),
        }
    }
}

/// Register accessor statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegStatsSnapshot {
    pub reg_write_fail: u32,
    pub shadow_write_succ: u32,
    pub shadow_write_fail: u32,
    pub wake_fail: u32,
}

/// Bounded retry: run `poll` up to `max_attempts` times, `delay` apart, until
/// it reports success.
pub(crate) fn poll_until(
    max_attempts: u32,
    delay: Duration,
    mut poll: impl FnMut() -> bool,
) -> HalResult<()> {
    for attempt in 0..max_attempts {
        if poll() {
            return Ok(());
        }
        if attempt + 1 < max_attempts {
            block_for(delay);
        }
    }
    Err(HalError::Timeout)
}

impl<B: DeviceIo> Hal<B> {
    /// Declare whether datapath rings are still being brought up. During the
    /// init phase no wake handshake is performed.
    pub fn set_init_phase(&self, init_phase: bool) {
        self.init_phase.store(init_phase, Ordering::Release);
    }

    fn in_init_phase(&self) -> bool {
        self.init_phase.load(Ordering::Acquire)
    }

    /// Run `op` inside a wake-request/wake-release bracket when the region
    /// and device state require one. Handshake failures abort the access and
    /// escalate to the recovery hook.
    fn with_wake<T>(&self, op: impl FnOnce(&Self) -> T) -> HalResult<T> {
        if !self.caps.use_force_wake || self.in_init_phase() {
            return Ok(op(self));
        }
        if !self.bus.request_wake() {
            error!("wake up request failed");
            self.reg_stats.wake_fail.fetch_add(1, Ordering::Relaxed);
            self.bus
                .trigger_self_recovery(RecoveryReason::WakeRequestFailure);
            return Err(HalError::RecoveryTriggered);
        }
        let ret = op(self);
        if !self.bus.release_wake() {
            error!("wake up release failed");
            self.reg_stats.wake_fail.fetch_add(1, Ordering::Relaxed);
            self.bus
                .trigger_self_recovery(RecoveryReason::WakeReleaseFailure);
            return Err(HalError::RecoveryTriggered);
        }
        Ok(ret)
    }

    /// Program the remap window for `offset` if the currently selected bank
    /// differs, and confirm the select write.
    fn select_window(&self, window: &Cell<u32>, offset: u32) {
        let new = (offset >> self.caps.window_shift) & self.caps.window_value_mask;
        if new != window.get() {
            self.bus
                .write32(self.caps.window_reg_offset, WINDOW_ENABLE_BIT | new);
            window.set(new);
            self.check_written(self.caps.window_reg_offset, WINDOW_ENABLE_BIT | new);
        }
    }

    /// Read back a just-written routed offset and record a mismatch. This is
    /// observability, not an error path.
    fn check_written(&self, routed_offset: u32, expected: u32) {
        let read = self.bus.read32(routed_offset);
        if read != expected {
            warn!(
                "write failed at reg offset {:#x}, wrote {:#x} read {:#x}",
                routed_offset, expected, read
            );
            self.reg_stats.reg_write_fail.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn write32_routed(&self, offset: u32, value: u32, confirm: bool) {
        if !self.caps.use_register_windowing || offset < self.caps.window_start {
            self.bus.write32(offset, value);
            if confirm {
                self.check_written(offset, value);
            }
        } else {
            self.window.lock(|window| {
                self.select_window(window, offset);
                let routed =
                    self.caps.window_start + (offset & self.caps.window_range_mask());
                self.bus.write32(routed, value);
                if confirm {
                    self.check_written(routed, value);
                }
            });
        }
    }

    fn read32_routed(&self, offset: u32) -> u32 {
        if !self.caps.use_register_windowing || offset < self.caps.window_start {
            self.bus.read32(offset)
        } else {
            self.window.lock(|window| {
                self.select_window(window, offset);
                self.bus
                    .read32(self.caps.window_start + (offset & self.caps.window_range_mask()))
            })
        }
    }

    /// Write a device register, routing through the wake handshake and the
    /// remap window as the offset requires.
    pub fn write32(&self, offset: u32, value: u32) -> HalResult<()> {
        if offset < self.caps.always_mapped_off {
            self.bus.write32(offset, value);
            return Ok(());
        }
        self.with_wake(|hal| hal.write32_routed(offset, value, false))
    }

    /// Read a device register, with the same routing as
    /// [write32](Self::write32).
    pub fn read32(&self, offset: u32) -> HalResult<u32> {
        if offset < self.caps.always_mapped_off {
            return Ok(self.bus.read32(offset));
        }
        self.with_wake(|hal| hal.read32_routed(offset))
    }

    /// Write and read back immediately. A mismatch bumps the failure
    /// statistic and logs, but does not fail the write.
    pub fn write32_confirm(&self, offset: u32, value: u32) -> HalResult<()> {
        if offset < self.caps.always_mapped_off {
            self.bus.write32(offset, value);
            self.check_written(offset, value);
            return Ok(());
        }
        self.with_wake(|hal| hal.write32_routed(offset, value, true))
    }

    /// Confirmed write with bounded retry; the path that decides whether the
    /// device is wedged.
    ///
    /// With shadow registers enabled, the write goes through
    /// [write32_shadow_confirm](Self::write32_shadow_confirm) instead of the
    /// retry loop. If all attempts are exhausted and `recovery` is set, the
    /// self-recovery hook fires and [HalError::RecoveryTriggered] is
    /// returned.
    pub fn write32_confirm_retry(
        &self,
        offset: u32,
        value: u32,
        recovery: bool,
    ) -> HalResult<()> {
        let result = if self.caps.shadow_regs_enabled {
            self.write32_shadow_confirm(offset, value)
        } else {
            poll_until(REG_WRITE_RETRY_MAX + 1, REG_WRITE_RETRY_DELAY, || {
                if self.write32_confirm(offset, value).is_err() {
                    return false;
                }
                match self.read32(offset) {
                    Ok(read) if read == value => true,
                    Ok(read) => {
                        warn!(
                            "retry reg offset {:#x}, value {:#x}, read value {:#x}",
                            offset, value, read
                        );
                        false
                    }
                    Err(_) => false,
                }
            })
            .map_err(|_| HalError::WriteMismatch)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                if recovery {
                    self.bus
                        .trigger_self_recovery(RecoveryReason::RegWriteFailure);
                    Err(HalError::RecoveryTriggered)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Write through the shadow register mapped to `reg_offset` and poll the
    /// dirty bit until the device consumed the value.
    ///
    /// A poll timeout is a soft failure: the caller decides whether to retry
    /// or declare the ring unhealthy.
    pub fn write32_shadow_confirm(&self, reg_offset: u32, value: u32) -> HalResult<()> {
        let Some(config) = self.shadow_lookup(reg_offset) else {
            warn!("no shadow config for reg offset {:#x}", reg_offset);
            return Err(HalError::InvalidConfig);
        };
        let shadow_offset = self.caps.shadow_reg_base + 4 * config.shadow_config_index as u32;
        self.write32_confirm(shadow_offset, value)?;
        match self.poll_dirty_bit(config.shadow_config_index) {
            Ok(()) => {
                debug!("shadow write: reg {:#x} val {:#x}", reg_offset, value);
                self.reg_stats.shadow_write_succ.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.reg_stats.shadow_write_fail.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn poll_dirty_bit(&self, shadow_config_index: u8) -> HalResult<()> {
        let (reg_offset, bit_pos) = if shadow_config_index > 0
            && shadow_config_index < SHADOW_REG_INDEX_LOW
        {
            (self.caps.dirty_bit_reg_low, shadow_config_index as u32)
        } else if shadow_config_index >= SHADOW_REG_INDEX_LOW
            && shadow_config_index < SHADOW_REG_INDEX_HIGH
        {
            (
                self.caps.dirty_bit_reg_high,
                (shadow_config_index - SHADOW_REG_INDEX_LOW) as u32,
            )
        } else {
            warn!("invalid shadow config index {}", shadow_config_index);
            return Err(HalError::InvalidConfig);
        };
        let dirty_reg = self.caps.dirty_bit_wrapper_base + reg_offset;
        poll_until(SHADOW_DIRTY_BIT_POLL_MAX, SHADOW_DIRTY_BIT_POLL_DELAY, || {
            match self.read32(dirty_reg) {
                // The device clears the dirty bit once it has taken the
                // shadow value.
                Ok(read) => !check_bit!(read, bit!(bit_pos)),
                Err(_) => false,
            }
        })
    }

    fn shadow_lookup(&self, target_register: u32) -> Option<ShadowRegConfig> {
        self.shadow_cfg
            .iter()
            .flatten()
            .copied()
            .find(|config| config.target_register == target_register)
    }

    pub fn reg_stats(&self) -> RegStatsSnapshot {
        RegStatsSnapshot {
            reg_write_fail: self.reg_stats.reg_write_fail.load(Ordering::Relaxed),
            shadow_write_succ: self.reg_stats.shadow_write_succ.load(Ordering::Relaxed),
            shadow_write_fail: self.reg_stats.shadow_write_fail.load(Ordering::Relaxed),
            wake_fail: self.reg_stats.wake_fail.load(Ordering::Relaxed),
        }
    }
}
