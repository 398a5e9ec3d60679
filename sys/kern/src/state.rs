// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel-state aggregate.
//!
//! All mutable kernel state lives in one `Kernel` value, constructed once
//! by `startup::Config::init_kernel` and reached afterwards only through
//! the platform anchor (`arch::with_kernel`). User code never touches it
//! directly; every mutation from user context goes through the system-call
//! dispatcher.

use abi::{Pid, Priority};

use crate::dispatch::FrameStack;
use crate::proc::ProcTable;
use crate::sched::EventTable;
use crate::time::KernelTime;

pub struct Kernel {
    /// System time and tick step.
    pub(crate) time: KernelTime,
    /// Events and the global task vector.
    pub(crate) events: EventTable,
    /// Process descriptors, grant tables, suspend-permission matrix.
    pub(crate) procs: ProcTable,
    /// Activation frames of the tasks currently on the supervisor stack.
    pub(crate) frames: FrameStack,
    /// Least priority at which `run_task` may currently be re-entered
    /// from user code; bounds supervisor-stack growth.
    pub(crate) run_task_floor: Priority,
    /// Set once init completes; init-only operations check it.
    pub(crate) started: bool,
}

impl Kernel {
    pub(crate) fn new(events: EventTable, procs: ProcTable) -> Self {
        Self {
            time: KernelTime::new(),
            events,
            procs,
            frames: FrameStack::new(),
            run_task_floor: Priority::IDLE,
            started: false,
        }
    }

    /// The process on whose behalf code is currently executing:
    /// the owner of the innermost activation frame, or the kernel when no
    /// user task is on the stack.
    pub(crate) fn current_pid(&self) -> Pid {
        self.frames
            .current()
            .map(|frame| frame.pid)
            .unwrap_or(Pid::KERNEL)
    }
}
