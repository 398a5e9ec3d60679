// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Static-configuration problems are ordinary `Result` errors: the kernel
//! refuses to start and the caller gets a `ConfigError` saying why.
//! Runtime misbehavior by user code never surfaces as a Rust error at all
//! -- it becomes a counted task abort, and the only error-shaped thing in
//! that path is [`BadArgument`], the signal a system-call handler hands
//! back to the dispatcher to say "tear down the caller".

use abi::Pid;

/// A problem with the static configuration, detected during registration
/// or during `init_kernel`. The kernel does not start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// All event slots are in use.
    EventTableFull,
    /// The global task vector is full.
    TaskTableFull,
    /// Event priority 0 or at/above the scheduler's own level.
    BadEventPriority,
    /// Period/first-activation field with reserved bits set, or a first
    /// activation given for a software-only event.
    BadEventTime,
    /// Minimum triggering PID beyond `NUM_PROCESSES + 1`.
    BadTriggerPid,
    /// Task registered against an event id never issued.
    UnknownEvent,
    /// PID out of range.
    BadPid,
    /// Task budget above the ceiling.
    BudgetTooLarge,
    /// Kernel tasks run unmonitored; a nonzero budget on one is a
    /// configuration mistake, not a request.
    OsTaskWithBudget,
    /// Second init task for one process.
    DuplicateInitTask,
    /// Event with an empty task list at start.
    EventWithoutTask,
    /// Process given a stack but owning no task at all.
    ProcessUnused,
    /// Task owned by a process that was never given a stack.
    ProcessNotConfigured,
    /// Stack region misaligned, out of size range, or overlapping another
    /// process's stack.
    StackBad,
    /// A process's memory-grant table is full, unsorted, or overlapping.
    RegionBad,
    /// Suspend permission granted against the supervisory process.
    SuspendGrantBad,
    /// Event at the unblockable tier with a user task outside the OS
    /// process and the supervisory process.
    UnblockableTierViolation,
    /// An init task reported failure; the code is what it returned.
    InitTaskFailed { pid: Pid, code: i32 },
}

/// Signal from a system-call handler that the caller supplied an argument
/// it must not survive. The dispatcher turns this into a `SysCallBadArg`
/// abort of the calling task; it never reaches application code as a
/// value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BadArgument;
