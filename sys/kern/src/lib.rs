// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Safety kernel.
//!
//! This is the application-independent portion of the operating system: a
//! small fixed-priority kernel that dispatches a statically configured set
//! of tasks, grouped into events and isolated into processes of graded
//! privilege. Scheduling rides directly on the hardware interrupt
//! controller -- there are no ready queues; "ready" is a pending
//! software-interrupt bit, and "running" is the highest-priority pending
//! context.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic
//! ideas that appear consistently.
//!
//! 1. Static configuration. The system takes a single shape, declared
//!    before start and validated exhaustively; nothing is created at
//!    runtime.
//! 2. Failure is data. A task that misbehaves is torn down and counted,
//!    never propagated as an exception; supervisory tasks read the
//!    counters and enact policy.
//! 3. A strong preference for safe code where reasonable, and for simple
//!    and clear algorithms over fast and clever ones.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod descs;
pub mod dispatch;
pub mod err;
pub mod fail;
pub mod pcp;
pub mod proc;
pub mod sched;
pub mod startup;
pub mod state;
pub mod syscalls;
pub mod time;
pub mod umem;

pub use abi::{
    AbortCause, ConformanceClass, EventId, Pid, Priority, Sysnum,
    KERNEL_PRIORITY, MAX_PCP_CEILING, MAX_TASK_BUDGET, NUM_ABORT_CAUSES,
    NUM_EVENTS, NUM_PROCESSES, TICK_MS, UNBLOCKABLE_PRIORITY,
};

/// Capacity of the global task vector shared by all events.
pub const MAX_TASKS: usize = 32;

/// Capacity of one process's memory-grant table, stack included.
pub const REGIONS_PER_PROCESS: usize = 8;

/// Bound on nested task activations (event nesting plus `run_task`
/// recursion). Running out of frames is a kernel failure, not a task
/// abort.
pub const MAX_NESTED_ACTIVATIONS: usize = 16;

// Event task lists are (u16, u16) ranges, and every event could nest one
// activation frame at once.
static_assertions::const_assert!(MAX_TASKS <= u16::MAX as usize);
static_assertions::const_assert!(MAX_NESTED_ACTIVATIONS > NUM_EVENTS);
