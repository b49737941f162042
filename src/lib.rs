//! # `srng-hal`
//! This is a driver layer for the shared-ring (SRNG) datapath of a WiFi
//! device: circular descriptor queues in memory shared between the host CPU
//! and the radio, plus the register plumbing and doorbell-coalescing policies
//! around them.
//! ## Hardware overview
//! This chapter gives a short overview of the structures this crate drives.
//!
//! ### Shared rings
//! A ring is a fixed-size circular buffer of fixed-width entries; the entry
//! size is not necessarily a power of two, so all index arithmetic wraps by
//! modulo. Each ring has a head pointer (`hp`) and a tail pointer (`tp`). On
//! a *source* ring the host produces: it owns `hp`, and the device reports
//! consumption through `tp`. On a *destination* ring the device produces and
//! the host owns `tp`. One slot is always left empty, so `hp == tp` means
//! empty and advancing `hp` onto `tp` would mean full; this is how the two
//! states stay distinguishable.
//!
//! Every pointer has exactly one writer. The host-owned pointer only moves
//! inside an access bracket ([access_start](SrcRing::access_start) ..
//! `end`), which holds the ring's lock; the device-owned pointer is read from
//! a shared memory word the device DMA-writes. Source rings additionally keep
//! a reap pointer, so buffers of completed entries can be reclaimed before
//! their slots are reposted, and a slot is never reused while the device
//! might still look at it.
//!
//! ### Register access
//! The device's register space splits into three regions: a low region that
//! is always mapped, a middle region that requires a force-wake handshake
//! while the datapath is live, and a high region reached through a remap
//! window. The accessor routes every access by offset, memoizes the selected
//! window bank, and optionally confirms writes by reading back, with a
//! bounded retry and a recovery escalation for writes that never stick.
//! Devices that confirm writes through shadow registers get the
//! dirty-bit-poll variant instead. All of this is configured once at attach
//! through [DeviceCaps]; nothing is selected at compile time.
//!
//! ### Doorbell coalescing
//! Telling the device that a ring pointer moved costs a register write, so
//! the doorbell may be deferred: an access bracket can end with the new
//! pointer merely queued ([end_deferred](SrcAccess::end_deferred)), and only
//! the latest queued value is ever written out. Two policy layers decide the
//! timing: [Swlm] samples throughput and coalesces only on busy rings, in
//! sessions bounded by bytes and time; [Lapb] keys on per-frame latency
//! tolerance tags and keeps one shared timer armed for the most impatient
//! pending frame. Both funnel into the same pending-doorbell slot, and a
//! flush from either side always wins over coalescing
//! ([TxDecision::combine]). Timer contexts never block on a ring lock: a
//! busy ring is left a flush event, honored by the next access bracket.

#![cfg_attr(not(test), no_std)]
pub(crate) mod fmt;

mod delayed;
mod hal;
mod lapb;
#[cfg(test)]
pub(crate) mod mock;
mod reg;
mod srng;
mod swlm;
mod sync;

pub use delayed::DelayedWriteStats;
pub use hal::{Hal, HalError, HalMemInfo, HalResult};
pub use lapb::{FrameMeta, Lapb, LapbConfig, LapbStatsSnapshot};
pub use reg::{
    DeviceCaps, DeviceIo, RecoveryReason, RegStatsSnapshot, ShadowRegConfig, MAX_SHADOW_REGS,
    WINDOW_ENABLE_BIT,
};
pub use srng::{
    AccessGuard, DstAccess, DstRing, RingHandle, RingPointerPair, RingStats, SrcAccess, SrcRing,
    Src, Dst, SrngDir, SrngFlags, SrngParams, FLUSH_EVENT, MAX_RINGS, WM_BINS,
};
pub use swlm::{Swlm, SwlmConfig, SwlmStatsSnapshot, TrafficSnapshot, TxDecision};
pub use sync::DeadlineSignal;

#[cfg(not(feature = "critical_section"))]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical_section")]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
