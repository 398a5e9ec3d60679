// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task dispatcher.
//!
//! Dispatching is the privilege crossing: supervisor code (the scheduler,
//! or a more privileged task through a system call) runs one task
//! function in user state and gets back either the task's own result or
//! the abort that ended it, as a signed code. Per activation, the
//! dispatcher keeps one frame on the supervisor stack recording who is
//! running, since when, on what budget, and at what priority the caller
//! left off; the trap handlers find the innermost frame through the
//! kernel anchor when they need to tear the activation down.
//!
//! Every abort is charged to the owning process's counters on the way
//! out. Nothing is thrown past this module.

use abi::{AbortCause, Pid, Priority, MAX_TASK_BUDGET};

use crate::arch::{self, TaskAbort};
use crate::descs::TaskDesc;
use crate::err::BadArgument;
use crate::proc::ProcState;
use crate::state::Kernel;
use crate::syscalls::SysCallArgs;
use crate::time::Timestamp;
use crate::{fail, umem, MAX_NESTED_ACTIVATIONS};

/// Per-activation record, alive exactly while its task is somewhere on
/// the supervisor stack.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Frame {
    /// Owning process of the running task.
    pub(crate) pid: Pid,
    /// Timebase at entry; deadline monitoring measures from here.
    entry_time: Timestamp,
    /// Budget in timebase ticks; 0 disables monitoring.
    budget: u32,
    /// Priority the caller was at, restored in the epilogue no matter how
    /// the task ends.
    saved_priority: Priority,
}

impl Frame {
    fn overran(&self, now: Timestamp) -> bool {
        self.budget != 0 && now.since(self.entry_time) > self.budget as u64
    }
}

/// The stack of activation frames. Mirrors the nesting of dispatches on
/// the supervisor stack; the innermost frame is what trap handlers act
/// on.
pub(crate) struct FrameStack {
    frames: heapless::Vec<Frame, MAX_NESTED_ACTIVATIONS>,
}

impl FrameStack {
    pub(crate) fn new() -> Self {
        Self {
            frames: heapless::Vec::new(),
        }
    }

    pub(crate) fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    fn push(&mut self, frame: Frame) -> Result<(), ()> {
        self.frames.push(frame).map(|_| ()).map_err(|_| ())
    }

    fn pop(&mut self) -> Frame {
        match self.frames.pop() {
            Some(frame) => frame,
            None => fail::die("dispatcher epilogue without a frame"),
        }
    }
}

/// The checkpoint test: does the innermost running task need to be torn
/// down? Consulted at every kernel-visible checkpoint -- the tick and
/// each system-call entry -- which is what bounds abort latency to about
/// a millisecond.
pub(crate) fn checkpoint_cause(k: &Kernel) -> Option<AbortCause> {
    let frame = k.frames.current()?;
    if k.procs.state(frame.pid) == ProcState::Stopped {
        return Some(AbortCause::ProcessAbort);
    }
    if frame.overran(arch::timebase().into()) {
        return Some(AbortCause::Deadline);
    }
    None
}

/// Runs one user task to completion (or abort) and returns the signed
/// result: the task's own non-negative result, or `cause.error_code()`.
///
/// `bypass_state_check` is for init tasks, which run while their
/// processes are still formally Stopped.
fn run_task_common(task: &TaskDesc, param: u32, bypass_state_check: bool) -> i32 {
    let entry = task.entry;
    let pid = task.pid;

    let admitted = arch::with_kernel(|k| {
        uassert!(pid.is_user() && pid.is_valid());
        // Re-read the owner's run state on every entry; a suspension that
        // raced us turns the activation into a counted ProcessAbort
        // before any user code runs.
        if !bypass_state_check && k.procs.state(pid) != ProcState::Running {
            k.procs.count_abort(pid, AbortCause::ProcessAbort);
            return false;
        }
        klog!(
            "dispatching task in process {}, user sp {:#x}",
            pid.0,
            k.procs.user_sp(pid)
        );
        let frame = Frame {
            pid,
            entry_time: arch::timebase().into(),
            budget: task.budget,
            saved_priority: arch::current_priority(),
        };
        if k.frames.push(frame).is_err() {
            fail::die("activation frames exhausted");
        }
        true
    });
    if !admitted {
        return AbortCause::ProcessAbort.error_code();
    }

    // User state. Kernel state is unclaimed while the task runs, so the
    // task's own system calls can reach it.
    let outcome = arch::call_user(entry, param);

    arch::with_kernel(|k| {
        let frame = k.frames.pop();
        let overran = frame.overran(arch::timebase().into());
        arch::set_current_priority(frame.saved_priority);

        let verdict = match outcome {
            // A normal return and the terminate-task system call are the
            // same thing to us: a final result value. The deadline always
            // wins over it -- the comparator would have fired mid-task.
            Ok(value) | Err(TaskAbort::Terminate(value)) => {
                if overran {
                    Err(AbortCause::Deadline)
                } else if value < 0 {
                    Err(AbortCause::UserAbort)
                } else {
                    Ok(value)
                }
            }
            Err(TaskAbort::Cause(cause)) => Err(cause),
        };

        match verdict {
            Ok(value) => value,
            Err(cause) => {
                k.procs.count_abort(frame.pid, cause);
                klog!(
                    "task in process {} aborted, cause {:?}",
                    frame.pid.0,
                    cause
                );
                cause.error_code()
            }
        }
    })
}

/// Runs `task` on behalf of kernel context: the scheduler's event
/// handlers, or a kernel task that needs a result from user code.
///
/// Must not be called while a user task is already current; lesser
/// privilege reaches this operation through its system call instead.
pub fn os_run_task(task: &TaskDesc, param: u32) -> i32 {
    arch::with_kernel(|k| {
        uassert!(k.frames.current().is_none());
        uassert!(task.budget <= MAX_TASK_BUDGET);
    });
    run_task_common(task, param, false)
}

/// Dispatch of one event-list task; kernel-internal.
pub(crate) fn run_event_task(task: &TaskDesc, event_slot: u32) -> i32 {
    run_task_common(task, event_slot, false)
}

/// Runs a process's init task during kernel init, before processes are
/// released -- the one dispatch that skips the run-state check.
pub(crate) fn run_init_task(task: &TaskDesc, param: u32) -> i32 {
    run_task_common(task, param, true)
}

/// User entry point: run a task in a strictly less privileged process
/// and get its result. The caller keeps running at its current priority;
/// the callee's aborts are contained and surface only as the returned
/// code.
pub fn sc_run_task(task: &TaskDesc, param: u32) -> i32 {
    crate::syscalls::system_call(
        abi::Sysnum::RunTask as u32,
        SysCallArgs::new([
            task as *const TaskDesc as usize,
            param as usize,
            0,
            0,
        ]),
    ) as i32
}

/// Handler for the run-task system call (Full class).
///
/// To bound supervisor-stack growth the handler keeps a re-entry floor:
/// for the duration of each call, using the call again requires a
/// priority above the caller's. Recursing legitimately therefore takes a
/// priority-ceiling raise first, and the small number of ceiling levels
/// bounds the depth.
pub(crate) fn sys_run_task(
    caller: Pid,
    args: &SysCallArgs,
) -> Result<usize, BadArgument> {
    let args = args.as_run_task_args();
    let staged = arch::with_kernel(|k| {
        if !caller.is_user() {
            return Err(BadArgument);
        }
        let addr = args.desc_addr();
        // The descriptor lives in caller memory; the caller must be able
        // to read what it is asking us to read.
        if !umem::user_ref_ok::<TaskDesc>(k, caller, addr) {
            return Err(BadArgument);
        }
        // Safety: aligned, sized, and covered by the caller's readable
        // grants, per the check above.
        let task = unsafe { *(addr as *const TaskDesc) };

        if !task.pid.is_user() || !task.pid.is_valid() {
            return Err(BadArgument);
        }
        if !caller.outranks(task.pid) {
            return Err(BadArgument);
        }
        if task.budget > MAX_TASK_BUDGET {
            return Err(BadArgument);
        }

        let current = arch::current_priority();
        if k.run_task_floor.is_more_important_than(current) {
            // Below the re-entry floor.
            return Err(BadArgument);
        }
        let saved_floor = k.run_task_floor;
        k.run_task_floor = Priority(current.0 + 1);
        Ok((task, saved_floor))
    });
    let (task, saved_floor) = staged?;

    let code = run_task_common(&task, args.param(), false);

    arch::with_kernel(|k| k.run_task_floor = saved_floor);
    Ok(code as usize)
}

/// User entry point: ends the calling activation, propagating `result`
/// as if the task function had returned it. Negative results are counted
/// as `UserAbort`, like a negative return.
pub fn terminate_user_task(result: i32) -> ! {
    crate::syscalls::system_call(
        abi::Sysnum::TerminateTask as u32,
        SysCallArgs::new([result as usize, 0, 0, 0]),
    );
    // The call tears the activation down and never comes back; getting
    // here means it was made from kernel context, which the handler
    // already refused.
    fail::die("terminate_user_task survived its system call")
}

/// Handler for the terminate-task system call (Basic class).
pub(crate) fn sys_terminate_task(
    k: &mut Kernel,
    _caller: Pid,
    args: &SysCallArgs,
) -> Result<usize, BadArgument> {
    if k.frames.current().is_none() {
        return Err(BadArgument);
    }
    arch::terminate_current_task(args.arg0() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcTable;
    use crate::sched::EventTable;

    fn kernel_with_running_process(pid: Pid) -> Kernel {
        let mut procs = ProcTable::new();
        procs.release(pid);
        Kernel::new(EventTable::new(), procs)
    }

    fn frame(pid: Pid, budget: u32) -> Frame {
        Frame {
            pid,
            entry_time: arch::timebase().into(),
            budget,
            saved_priority: arch::current_priority(),
        }
    }

    #[test]
    fn checkpoint_is_quiet_without_a_frame() {
        let k = kernel_with_running_process(Pid(1));
        assert_eq!(checkpoint_cause(&k), None);
    }

    #[test]
    fn checkpoint_catches_suspension() {
        let mut k = kernel_with_running_process(Pid(1));
        k.frames.push(frame(Pid(1), 0)).unwrap();
        assert_eq!(checkpoint_cause(&k), None);

        k.procs.suspend(Pid(1));
        assert_eq!(checkpoint_cause(&k), Some(AbortCause::ProcessAbort));
    }

    #[test]
    fn checkpoint_catches_budget_overrun_but_not_exact_use() {
        let mut k = kernel_with_running_process(Pid(2));
        k.frames.push(frame(Pid(2), 1_000)).unwrap();

        arch::advance_timebase(1_000);
        assert_eq!(checkpoint_cause(&k), None);
        arch::advance_timebase(1);
        assert_eq!(checkpoint_cause(&k), Some(AbortCause::Deadline));
    }

    #[test]
    fn unmonitored_frames_never_overrun() {
        let mut k = kernel_with_running_process(Pid(2));
        k.frames.push(frame(Pid(2), 0)).unwrap();
        arch::advance_timebase(u32::MAX as u64 * 4);
        assert_eq!(checkpoint_cause(&k), None);
    }

    #[test]
    fn frame_stack_tracks_the_innermost_activation() {
        let mut frames = FrameStack::new();
        assert!(frames.current().is_none());
        frames.push(frame(Pid(1), 0)).unwrap();
        frames.push(frame(Pid(3), 0)).unwrap();
        assert_eq!(frames.current().unwrap().pid, Pid(3));
        assert_eq!(frames.pop().pid, Pid(3));
        assert_eq!(frames.current().unwrap().pid, Pid(1));
    }

    #[test]
    fn frame_capacity_is_bounded() {
        let mut frames = FrameStack::new();
        for _ in 0..crate::MAX_NESTED_ACTIVATIONS {
            frames.push(frame(Pid(1), 0)).unwrap();
        }
        assert!(frames.push(frame(Pid(1), 0)).is_err());
    }
}
