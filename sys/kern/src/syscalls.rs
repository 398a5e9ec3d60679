// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The system-call dispatcher.
//!
//! A system call is a call number plus a handful of register-sized
//! argument words. The number indexes a fixed descriptor table; each
//! descriptor names a handler and the conformance class that decides the
//! machine state the handler runs under (see
//! [`abi::ConformanceClass`]). The table is read-only after construction
//! and lives in ROM next to the kernel, short-addressable for the entry
//! stub's benefit.
//!
//! # Handler conventions
//!
//! Handlers return `Result<usize, BadArgument>`. `Ok` is the value handed
//! back to the caller; `BadArgument` asks the dispatcher to abort the
//! calling task with `SysCallBadArg`, which is also what an out-of-range
//! call number earns. That abort path exists only for user callers: from
//! kernel context a bad system call is a kernel bug and fatal.
//!
//! Arguments are raw words. Each call reads them through an *argument
//! proxy* that assigns names and types, so handlers never index the
//! register array directly.

use abi::{AbortCause, ConformanceClass, Pid, Sysnum, SYSCALL_TABLE_LEN};

use crate::err::BadArgument;
use crate::state::Kernel;
use crate::{arch, dispatch, fail, pcp, proc, sched};

/// The register-sized argument words of one system call.
#[derive(Copy, Clone, Debug)]
pub struct SysCallArgs {
    regs: [usize; 4],
}

impl SysCallArgs {
    pub const fn new(regs: [usize; 4]) -> Self {
        Self { regs }
    }

    pub fn arg0(&self) -> usize {
        self.regs[0]
    }

    pub fn arg1(&self) -> usize {
        self.regs[1]
    }

    /// Proxy for the trigger-event call.
    pub(crate) fn as_trigger_args(&self) -> AsTriggerArgs<'_> {
        AsTriggerArgs(self)
    }

    /// Proxy for the suspend-process call.
    pub(crate) fn as_suspend_args(&self) -> AsSuspendArgs<'_> {
        AsSuspendArgs(self)
    }

    /// Proxy for the run-task call.
    pub(crate) fn as_run_task_args(&self) -> AsRunTaskArgs<'_> {
        AsRunTaskArgs(self)
    }

    /// Proxy for the priority-ceiling calls.
    pub(crate) fn as_priority_args(&self) -> AsPriorityArgs<'_> {
        AsPriorityArgs(self)
    }
}

/// Reference proxy for trigger-event argument words.
pub(crate) struct AsTriggerArgs<'a>(&'a SysCallArgs);

impl AsTriggerArgs<'_> {
    /// Extracts the event index the caller wants activated.
    pub(crate) fn event(&self) -> usize {
        self.0.arg0()
    }
}

/// Reference proxy for suspend-process argument words.
pub(crate) struct AsSuspendArgs<'a>(&'a SysCallArgs);

impl AsSuspendArgs<'_> {
    /// Extracts the process the caller wants stopped.
    pub(crate) fn target(&self) -> Pid {
        Pid(self.0.arg0() as u8)
    }
}

/// Reference proxy for run-task argument words.
pub(crate) struct AsRunTaskArgs<'a>(&'a SysCallArgs);

impl AsRunTaskArgs<'_> {
    /// Extracts the alleged address of the task descriptor. It is not
    /// dereferenceable until validated against the caller's grants.
    pub(crate) fn desc_addr(&self) -> usize {
        self.0.arg0()
    }

    /// Extracts the parameter to hand the task.
    pub(crate) fn param(&self) -> u32 {
        self.0.arg1() as u32
    }
}

/// Reference proxy for the priority-ceiling argument word.
pub(crate) struct AsPriorityArgs<'a>(&'a SysCallArgs);

impl AsPriorityArgs<'_> {
    /// Extracts the requested level, unvalidated.
    pub(crate) fn level(&self) -> usize {
        self.0.arg0()
    }
}

/// One system-call descriptor: the handler, tagged with its conformance
/// class through the signature each class imposes.
///
/// `Basic` and `Simple` handlers receive kernel state directly -- they
/// run under the dispatcher's critical section, nothing can preempt them,
/// and they must come back quickly. `Full` handlers run preemptible at
/// the caller's priority and claim kernel state themselves in slices, so
/// they may take their time or dispatch user code.
#[derive(Copy, Clone)]
pub enum SysCallDesc {
    Basic(fn(&mut Kernel, Pid, &SysCallArgs) -> Result<usize, BadArgument>),
    Simple(fn(&mut Kernel, Pid, &SysCallArgs) -> Result<usize, BadArgument>),
    Full(fn(Pid, &SysCallArgs) -> Result<usize, BadArgument>),
}

impl SysCallDesc {
    pub fn conformance_class(&self) -> ConformanceClass {
        match self {
            Self::Basic(_) => ConformanceClass::Basic,
            Self::Simple(_) => ConformanceClass::Simple,
            Self::Full(_) => ConformanceClass::Full,
        }
    }
}

/// Handler for every slot nothing is assigned to.
fn sys_noop(
    _k: &mut Kernel,
    _caller: Pid,
    _args: &SysCallArgs,
) -> Result<usize, BadArgument> {
    Ok(0)
}

const fn build_table() -> [SysCallDesc; SYSCALL_TABLE_LEN] {
    let mut table = [SysCallDesc::Basic(sys_noop); SYSCALL_TABLE_LEN];
    table[Sysnum::TerminateTask as usize] =
        SysCallDesc::Basic(dispatch::sys_terminate_task);
    table[Sysnum::RaisePriority as usize] =
        SysCallDesc::Basic(pcp::sys_raise_priority);
    table[Sysnum::RestorePriority as usize] =
        SysCallDesc::Basic(pcp::sys_restore_priority);
    table[Sysnum::TriggerEvent as usize] =
        SysCallDesc::Full(sched::sys_trigger_event);
    table[Sysnum::SuspendProcess as usize] =
        SysCallDesc::Simple(proc::sys_suspend_process);
    table[Sysnum::RunTask as usize] = SysCallDesc::Full(dispatch::sys_run_task);
    table
}

/// The descriptor table. Slot 0 is terminate-task by contract; slot 6 is
/// reserved for the assert channel and stays a no-op here; everything
/// unlisted is the no-op basic handler.
static SYSCALL_TABLE: [SysCallDesc; SYSCALL_TABLE_LEN] = build_table();

/// The system-call entry point.
///
/// On hardware the trap stub saves volatile state and lands here; on the
/// hosted port the user-side wrappers call it directly. Either way this
/// is a kernel-visible checkpoint: before the call is even looked at, a
/// caller whose process has been suspended, or whose budget has run out,
/// is torn down.
pub fn system_call(nr: u32, args: SysCallArgs) -> usize {
    if let Some(cause) = arch::with_kernel(|k| dispatch::checkpoint_cause(k)) {
        arch::abort_current_task(cause);
    }
    let caller = arch::with_kernel(|k| k.current_pid());

    let Some(desc) = SYSCALL_TABLE.get(nr as usize) else {
        // Bogus call number.
        return system_call_bad_argument();
    };

    let result = match desc {
        SysCallDesc::Basic(handler) | SysCallDesc::Simple(handler) => {
            arch::with_irqs_disabled(|| {
                arch::with_kernel(|k| handler(k, caller, &args))
            })
        }
        SysCallDesc::Full(handler) => handler(caller, &args),
    };

    // On the way out of the trap the controller re-arbitrates: anything
    // the handler pended, or anything a lowered current priority now
    // admits (the ceiling-restore case), preempts right here.
    sched::service_pending();

    match result {
        Ok(value) => value,
        Err(BadArgument) => system_call_bad_argument(),
    }
}

/// Aborts the calling task with `SysCallBadArg`. Handlers call this (or
/// return `BadArgument`, which lands here) when an argument is beyond
/// salvage; it does not return.
///
/// Only legal on behalf of a running user task. The kernel has no one to
/// abort but itself, and does.
pub fn system_call_bad_argument() -> ! {
    let in_user_task =
        arch::with_kernel(|k| k.frames.current().is_some());
    if in_user_task {
        arch::abort_current_task(AbortCause::SysCallBadArg)
    } else {
        fail::die("bad system call from kernel context")
    }
}
