// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The priority-ceiling service.
//!
//! Mutual exclusion without blocking, queues, or inheritance: a task that
//! wants a resource raises the current-priority register to the
//! resource's ceiling, so every context that could contend -- any task or
//! ISR configured at or below the ceiling, on this core -- simply cannot
//! be dispatched until the task restores the register. Correct use is
//! strictly nested (raise, work, restore), but nothing here enforces
//! nesting; the caller keeps the previous level and is trusted to hand it
//! back.
//!
//! Both operations are Basic-class system calls: the read-modify-write of
//! the priority register must be indivisible, so they run under the
//! dispatcher's critical section.
//!
//! Ceilings stop two short of the scheduler: `KERNEL_PRIORITY - 1` is the
//! unblockable tier reserved for supervisory tasks, and raising to
//! `KERNEL_PRIORITY` itself would deadlock the tick.

use abi::{Pid, Priority, KERNEL_PRIORITY, MAX_PCP_CEILING};

use crate::arch;
use crate::err::BadArgument;
use crate::state::Kernel;
use crate::syscalls::SysCallArgs;

/// User entry point: raises the current priority to at least `ceiling`
/// and returns the level to restore later. A no-op (returning the
/// unchanged level) if the caller already runs above the ceiling.
/// Ceilings above [`MAX_PCP_CEILING`] abort the caller.
pub fn suspend_all_interrupts_by_priority(ceiling: Priority) -> Priority {
    Priority(crate::syscalls::system_call(
        abi::Sysnum::RaisePriority as u32,
        SysCallArgs::new([ceiling.0 as usize, 0, 0, 0]),
    ) as u8)
}

/// User entry point: restores the level returned by the matching
/// [`suspend_all_interrupts_by_priority`] call.
pub fn resume_all_interrupts_by_priority(previous: Priority) {
    crate::syscalls::system_call(
        abi::Sysnum::RestorePriority as u32,
        SysCallArgs::new([previous.0 as usize, 0, 0, 0]),
    );
}

/// Handler for the priority-ceiling raise (Basic class).
pub(crate) fn sys_raise_priority(
    _k: &mut Kernel,
    _caller: Pid,
    args: &SysCallArgs,
) -> Result<usize, BadArgument> {
    let requested = args.as_priority_args().level();
    if requested > MAX_PCP_CEILING.0 as usize {
        return Err(BadArgument);
    }
    let ceiling = Priority(requested as u8);
    let previous = arch::current_priority();
    if ceiling.is_more_important_than(previous) {
        arch::set_current_priority(ceiling);
    }
    Ok(previous.0 as usize)
}

/// Handler for the priority-ceiling restore (Basic class).
///
/// The saved level is validated like a ceiling, except that the
/// unblockable tier is admitted: a task dispatched there legitimately
/// saved it. What no argument can do is park the register at
/// `KERNEL_PRIORITY` and mask the tick.
pub(crate) fn sys_restore_priority(
    _k: &mut Kernel,
    _caller: Pid,
    args: &SysCallArgs,
) -> Result<usize, BadArgument> {
    let requested = args.as_priority_args().level();
    if requested >= KERNEL_PRIORITY.0 as usize {
        return Err(BadArgument);
    }
    arch::set_current_priority(Priority(requested as u8));
    Ok(0)
}
