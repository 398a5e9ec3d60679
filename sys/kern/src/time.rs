// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.
//!
//! Two clocks exist. The *system time* counts scheduler ticks in
//! milliseconds and drives event due-times; it lives in kernel state and
//! only moves while the kernel is started. The *timebase* is the
//! free-running CPU counter read through the platform shim; deadline
//! monitoring charges task execution against it.

use abi::TICK_MS;

/// A timebase reading, in CPU ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Ticks elapsed since `earlier`, assuming at most one counter wrap.
    pub fn since(self, earlier: Timestamp) -> u64 {
        self.0.wrapping_sub(earlier.0)
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// The system-time scalars of kernel state.
#[derive(Debug)]
pub struct KernelTime {
    /// Milliseconds since start, wrapping. Compared against event due
    /// times with the cyclic model in `kerncore`.
    now_ms: u32,
    /// Milliseconds added per tick; 0 while the kernel is halted, which is
    /// what keeps a stray timer interrupt from scheduling anything before
    /// init completes.
    tick_step_ms: u32,
}

impl KernelTime {
    pub(crate) const fn new() -> Self {
        Self {
            now_ms: 0,
            tick_step_ms: 0,
        }
    }

    pub(crate) fn now_ms(&self) -> u32 {
        self.now_ms
    }

    pub(crate) fn is_running(&self) -> bool {
        self.tick_step_ms != 0
    }

    /// Releases the clock; called once at the end of kernel init.
    pub(crate) fn start(&mut self) {
        self.tick_step_ms = TICK_MS;
    }

    /// One tick worth of progress.
    pub(crate) fn advance(&mut self) {
        self.now_ms = self.now_ms.wrapping_add(self.tick_step_ms);
    }
}
