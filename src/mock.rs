//! A scriptable register bus for unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
};

use crate::reg::{DeviceIo, RecoveryReason};

/// Registers stored sparsely; unwritten offsets read as zero. Offsets are
/// the *routed* bus offsets, i.e. windowed accesses land at
/// `window_start + (offset & range_mask)`.
pub(crate) struct MockBus {
    regs: RefCell<HashMap<u32, u32>>,
    /// Registers whose reads return a fixed value regardless of writes.
    stuck: RefCell<HashMap<u32, u32>>,
    writes: RefCell<Vec<(u32, u32)>>,
    wake_requests: Cell<u32>,
    wake_releases: Cell<u32>,
    fail_wake: Cell<bool>,
    recoveries: RefCell<Vec<RecoveryReason>>,
}

impl MockBus {
    pub(crate) fn new() -> Self {
        Self {
            regs: RefCell::new(HashMap::new()),
            stuck: RefCell::new(HashMap::new()),
            writes: RefCell::new(Vec::new()),
            wake_requests: Cell::new(0),
            wake_releases: Cell::new(0),
            fail_wake: Cell::new(false),
            recoveries: RefCell::new(Vec::new()),
        }
    }
    pub(crate) fn reg(&self, offset: u32) -> u32 {
        self.regs.borrow().get(&offset).copied().unwrap_or(0)
    }
    pub(crate) fn set_reg(&self, offset: u32, value: u32) {
        self.regs.borrow_mut().insert(offset, value);
    }
    /// Make reads of `offset` return `value` no matter what was written.
    pub(crate) fn stick_reg(&self, offset: u32, value: u32) {
        self.stuck.borrow_mut().insert(offset, value);
    }
    /// Number of writes issued to `offset` so far.
    pub(crate) fn writes_to(&self, offset: u32) -> usize {
        self.writes
            .borrow()
            .iter()
            .filter(|(o, _)| *o == offset)
            .count()
    }
    pub(crate) fn wake_requests(&self) -> u32 {
        self.wake_requests.get()
    }
    pub(crate) fn wake_releases(&self) -> u32 {
        self.wake_releases.get()
    }
    pub(crate) fn fail_wake(&self, fail: bool) {
        self.fail_wake.set(fail);
    }
    pub(crate) fn recoveries(&self) -> Vec<RecoveryReason> {
        self.recoveries.borrow().clone()
    }
}

impl DeviceIo for MockBus {
    fn read32(&self, offset: u32) -> u32 {
        if let Some(value) = self.stuck.borrow().get(&offset) {
            return *value;
        }
        self.reg(offset)
    }
    fn write32(&self, offset: u32, value: u32) {
        self.writes.borrow_mut().push((offset, value));
        self.regs.borrow_mut().insert(offset, value);
    }
    fn request_wake(&self) -> bool {
        if self.fail_wake.get() {
            return false;
        }
        self.wake_requests.set(self.wake_requests.get() + 1);
        true
    }
    fn release_wake(&self) -> bool {
        if self.fail_wake.get() {
            return false;
        }
        self.wake_releases.set(self.wake_releases.get() + 1);
        true
    }
    fn trigger_self_recovery(&self, reason: RecoveryReason) {
        self.recoveries.borrow_mut().push(reason);
    }
}
