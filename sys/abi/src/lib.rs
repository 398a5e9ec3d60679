// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.
//!
//! Everything in this crate is wire-stable: abort-cause indices, system-call
//! numbers, and the signed result-code convention are contracts with
//! application code and with external tooling, and must not be reordered.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Number of user processes. Process IDs run 1..=`NUM_PROCESSES`; PID 0 is
/// the kernel process and has no descriptor of its own.
pub const NUM_PROCESSES: usize = 4;

/// Number of event slots, matching the number of hardware software-interrupt
/// slots. Event IDs are issued densely from 0.
pub const NUM_EVENTS: usize = 8;

/// Number of distinct abort causes tracked by the per-process counters. This
/// is fixed by the `AbortCause` enumeration and part of the counter ABI.
pub const NUM_ABORT_CAUSES: usize = 13;

/// Length of the system-call descriptor table. Call numbers at or above this
/// value abort the caller.
pub const SYSCALL_TABLE_LEN: usize = 64;

/// Period of the scheduler tick in milliseconds.
pub const TICK_MS: u32 = 1;

/// Upper bound on a task's execution-time budget, in timebase ticks. Budgets
/// are compared with signed arithmetic against the free-running timebase, so
/// they must stay below the sign bit.
pub const MAX_TASK_BUDGET: u32 = i32::MAX as u32;

/// Names one of the isolation containers ("processes") of the application.
///
/// PID 0 is the kernel itself: tasks owned by it run in supervisor state,
/// without a user-mode transition and without deadline monitoring. User
/// processes count up from 1, and a numerically greater PID means a more
/// trusted process -- the suspend-permission matrix and the `run_task`
/// system call are both gated on this ordering.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct Pid(pub u8);

impl Pid {
    /// The kernel process.
    pub const KERNEL: Self = Self(0);

    /// Checks whether this PID names a user process (as opposed to the
    /// kernel). Does not check that the PID is in range.
    pub const fn is_user(self) -> bool {
        self.0 != 0
    }

    /// Checks whether this PID is valid at all, i.e. the kernel or one of
    /// the `NUM_PROCESSES` user processes.
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) <= NUM_PROCESSES
    }

    /// Index of this user process in kernel tables (PID 1 is row 0).
    ///
    /// Callers must have established `is_user() && is_valid()` first.
    pub const fn index(self) -> usize {
        self.0 as usize - 1
    }

    /// Checks whether `self` outranks `other` in the privilege ordering.
    /// Strictly: equal PIDs do not outrank each other.
    pub const fn outranks(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// An interrupt-priority level, as written to the interrupt controller's
/// current-priority register.
///
/// Numerically greater is more important, which is the hardware convention
/// on this interrupt controller -- note that this is the opposite of some
/// kernels. This type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on which direction "greater" runs;
/// use the named comparison instead.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

/// Priority level of the scheduler tick. Events may be configured at
/// 1..=`KERNEL_PRIORITY - 1` only; the tick itself can never be blocked by
/// anything the kernel schedules.
pub const KERNEL_PRIORITY: Priority = Priority(12);

/// The unblockable tier, `KERNEL_PRIORITY - 1`. Reserved for supervisory
/// work: the priority-ceiling service refuses ceilings at this level, so
/// tasks running here can be masked only by the tick itself.
pub const UNBLOCKABLE_PRIORITY: Priority = Priority(KERNEL_PRIORITY.0 - 1);

/// Highest ceiling the priority-ceiling service will grant,
/// `KERNEL_PRIORITY - 2`.
pub const MAX_PCP_CEILING: Priority = Priority(KERNEL_PRIORITY.0 - 2);

impl Priority {
    /// The idle level. Code running here is preempted by everything.
    pub const IDLE: Self = Self(0);

    /// Checks if `self` is strictly more important than `other`, i.e. a
    /// context at `self` preempts one at `other`.
    pub const fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// The more important of the two levels.
    pub const fn max(self, other: Self) -> Self {
        if self.0 > other.0 {
            self
        } else {
            other
        }
    }
}

/// Dense index of an event, which is also the index of the hardware
/// software-interrupt slot the event is wired to.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct EventId(pub u8);

impl EventId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Why a task activation was torn down early.
///
/// The discriminants index the per-process failure-counter array and are
/// wire-stable; new causes may only be appended in place of `Reserved`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum AbortCause {
    /// The owning process was suspended while the task was pending or
    /// running.
    ProcessAbort = 0,
    /// Machine-check exception taken in user state.
    MachineCheck = 1,
    /// The activation exceeded its execution-time budget.
    Deadline = 2,
    /// Bad system-call number, or bad argument detected by a handler.
    SysCallBadArg = 3,
    /// The task function reported failure by returning a negative value.
    UserAbort = 4,
    /// Alignment exception.
    Alignment = 5,
    /// Program interrupt (illegal or privileged instruction).
    ProgramInterrupt = 6,
    /// FPU-unavailable exception.
    FpuUnavailable = 7,
    /// Data-TLB miss or protection violation.
    DataTlb = 8,
    /// Instruction-TLB miss or protection violation.
    InstructionTlb = 9,
    /// Trap instruction, i.e. a failed assertion in user code.
    Trap = 10,
    /// SPE/embedded-FP instruction exception.
    SpeInstruction = 11,
    /// Not currently raised; the slot is kept so the counter array layout
    /// is stable.
    Reserved = 12,
}

impl AbortCause {
    /// Index of this cause in the per-process counter array.
    pub const fn as_index(self) -> usize {
        self as usize
    }

    /// The signed result code reported for an activation aborted with this
    /// cause. Codes are `-(cause + 1)` so that cause 0 is distinguishable
    /// from a successful zero result.
    pub const fn error_code(self) -> i32 {
        -(self as i32) - 1
    }

    /// Inverse of [`AbortCause::error_code`]. Non-negative codes and codes
    /// below the cause range yield `None`.
    pub fn from_error_code(code: i32) -> Option<Self> {
        if code >= 0 {
            return None;
        }
        Self::try_from((-code - 1) as u32).ok()
    }
}

/// We're using an explicit `TryFrom` impl instead of `FromPrimitive`
/// because this crate doesn't otherwise depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for AbortCause {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::ProcessAbort),
            1 => Ok(Self::MachineCheck),
            2 => Ok(Self::Deadline),
            3 => Ok(Self::SysCallBadArg),
            4 => Ok(Self::UserAbort),
            5 => Ok(Self::Alignment),
            6 => Ok(Self::ProgramInterrupt),
            7 => Ok(Self::FpuUnavailable),
            8 => Ok(Self::DataTlb),
            9 => Ok(Self::InstructionTlb),
            10 => Ok(Self::Trap),
            11 => Ok(Self::SpeInstruction),
            12 => Ok(Self::Reserved),
            _ => Err(()),
        }
    }
}

/// Environment contract under which a system-call handler runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConformanceClass {
    /// Runs with external interrupts disabled and without relying on the
    /// caller's stack or the small-data base pointers. For the shortest
    /// handlers, and the only class that may be entered from kernel
    /// context.
    Basic,
    /// Runs with external interrupts disabled but with the normal calling
    /// convention. Not preemptible.
    Simple,
    /// Runs preemptible at the caller's priority (or a level the caller
    /// raised via the priority-ceiling service). For services that may run
    /// longer or that themselves dispatch user code.
    Full,
}

/// Enumeration of system-call numbers.
///
/// Slot 6 is reserved for the assert channel in some builds and stays
/// bound to the no-op handler here. All unassigned slots are the no-op
/// basic handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Sysnum {
    /// End the calling activation, propagating a result value.
    TerminateTask = 0,
    /// Priority-ceiling raise.
    RaisePriority = 1,
    /// Priority-ceiling restore.
    RestorePriority = 2,
    /// Software-trigger an event.
    TriggerEvent = 5,
    /// Suspend a process, subject to the permission matrix.
    SuspendProcess = 9,
    /// Run a task in a less-privileged process.
    RunTask = 10,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because this crate doesn't depend on `num-traits` and
/// this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::TerminateTask),
            1 => Ok(Self::RaisePriority),
            2 => Ok(Self::RestorePriority),
            5 => Ok(Self::TriggerEvent),
            9 => Ok(Self::SuspendProcess),
            10 => Ok(Self::RunTask),
            _ => Err(()),
        }
    }
}

// The counter ABI and the priority layout are load-bearing; if one of these
// fires, wire contracts elsewhere need revisiting, not just the constant.
static_assertions::const_assert_eq!(AbortCause::Reserved as usize + 1, NUM_ABORT_CAUSES);
static_assertions::const_assert!(NUM_EVENTS <= 8);
static_assertions::const_assert!((KERNEL_PRIORITY.0 as usize) < 16);
static_assertions::const_assert!((Sysnum::RunTask as usize) < SYSCALL_TABLE_LEN);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_indices_are_wire_stable() {
        for i in 0..NUM_ABORT_CAUSES as u32 {
            let c = AbortCause::try_from(i).unwrap();
            assert_eq!(c.as_index(), i as usize);
        }
        assert!(AbortCause::try_from(NUM_ABORT_CAUSES as u32).is_err());
    }

    #[test]
    fn error_codes_round_trip() {
        for i in 0..NUM_ABORT_CAUSES as u32 {
            let c = AbortCause::try_from(i).unwrap();
            let code = c.error_code();
            assert!(code < 0);
            assert_eq!(AbortCause::from_error_code(code), Some(c));
        }
        assert_eq!(AbortCause::from_error_code(0), None);
        assert_eq!(AbortCause::from_error_code(7), None);
        assert_eq!(AbortCause::from_error_code(-14), None);
    }

    #[test]
    fn syscall_numbers_are_wire_stable() {
        assert_eq!(Sysnum::TerminateTask as u32, 0);
        assert_eq!(Sysnum::RaisePriority as u32, 1);
        assert_eq!(Sysnum::RestorePriority as u32, 2);
        assert_eq!(Sysnum::TriggerEvent as u32, 5);
        assert_eq!(Sysnum::SuspendProcess as u32, 9);
        assert_eq!(Sysnum::RunTask as u32, 10);
        // Slot 6 is reserved for the assert channel and must stay
        // unassigned here.
        assert!(Sysnum::try_from(6).is_err());
    }

    #[test]
    fn priority_direction() {
        assert!(KERNEL_PRIORITY.is_more_important_than(UNBLOCKABLE_PRIORITY));
        assert!(UNBLOCKABLE_PRIORITY.is_more_important_than(Priority::IDLE));
        assert!(!Priority(3).is_more_important_than(Priority(3)));
        assert_eq!(Priority(3).max(Priority(7)), Priority(7));
    }

    #[test]
    fn pid_ordering() {
        assert!(Pid(3).outranks(Pid(2)));
        assert!(!Pid(2).outranks(Pid(2)));
        assert!(Pid(1).outranks(Pid::KERNEL));
        assert!(Pid(NUM_PROCESSES as u8).is_valid());
        assert!(!Pid(NUM_PROCESSES as u8 + 1).is_valid());
    }
}
