// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processes: the kernel's fault domains.
//!
//! A process is a stack region, a memory-grant table, a two-state run
//! flag, and a set of failure counters. There is no process lifecycle to
//! speak of: all processes exist from boot, are released (Stopped ->
//! Running) at the end of kernel init, and can only ever go back to
//! Stopped -- suspension is permanent, the big hammer a supervisory task
//! swings when the counters say a fault domain has gone bad.

use abi::{AbortCause, Pid, NUM_ABORT_CAUSES, NUM_PROCESSES};

use crate::descs::{RegionDesc, StackDesc};
use crate::{arch, fail};
use crate::REGIONS_PER_PROCESS;

/// Fill word for fresh stacks; lets stack-depth tooling tell used from
/// untouched memory.
pub const STACK_SENTINEL: u32 = 0xA5A5_A5A5;

/// Words placed at the low end of each stack. A frame chain that runs into
/// the guard reads a null back pointer and all-ones return addresses,
/// which the MPU then refuses to fetch.
pub const STACK_GUARD: [u32; 4] = [0, 0xFFFF_FFFF, 0xFFFF_FFFF, 0xFFFF_FFFF];

/// Run state of a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcState {
    /// Tasks of this process must not run. Initial state, and final state
    /// after suspension.
    Stopped,
    /// Normal operation.
    Running,
}

/// One process descriptor.
#[derive(Debug)]
pub(crate) struct Process {
    state: ProcState,
    /// Stack pointer to hand to the process when it next resumes a
    /// preempted task.
    user_sp: usize,
    stack: Option<StackDesc>,
    total_aborts: u32,
    cause_aborts: [u32; NUM_ABORT_CAUSES],
}

impl Process {
    const fn new() -> Self {
        Self {
            state: ProcState::Stopped,
            user_sp: 0,
            stack: None,
            total_aborts: 0,
            cause_aborts: [0; NUM_ABORT_CAUSES],
        }
    }
}

/// The suspend-permission matrix: one bit per (caller, target) pair,
/// configured before start and immutable afterwards.
#[derive(Clone, Debug, Default)]
pub(crate) struct SuspendMatrix {
    /// Row per caller (PID 1 is row 0); bit per target (PID 1 is bit 0).
    rows: [u8; NUM_PROCESSES],
}

impl SuspendMatrix {
    pub(crate) fn grant(&mut self, caller: Pid, target: Pid) {
        self.rows[caller.index()] |= 1 << target.index();
    }

    pub(crate) fn allows(&self, caller: Pid, target: Pid) -> bool {
        self.rows[caller.index()] & (1 << target.index()) != 0
    }

    /// All targets ever granted to anyone, as a bit set. Used by init
    /// validation.
    pub(crate) fn granted_targets(&self) -> u8 {
        self.rows.iter().fold(0, |acc, row| acc | row)
    }
}

/// The process table plus everything configured per process.
pub(crate) struct ProcTable {
    procs: [Process; NUM_PROCESSES],
    pub(crate) grants: SuspendMatrix,
    regions: [heapless::Vec<RegionDesc, REGIONS_PER_PROCESS>; NUM_PROCESSES],
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        Self {
            procs: core::array::from_fn(|_| Process::new()),
            grants: SuspendMatrix::default(),
            regions: core::array::from_fn(|_| heapless::Vec::new()),
        }
    }

    fn get(&self, pid: Pid) -> &Process {
        uassert!(pid.is_user() && pid.is_valid());
        &self.procs[pid.index()]
    }

    fn get_mut(&mut self, pid: Pid) -> &mut Process {
        uassert!(pid.is_user() && pid.is_valid());
        &mut self.procs[pid.index()]
    }

    pub(crate) fn state(&self, pid: Pid) -> ProcState {
        self.get(pid).state
    }

    pub(crate) fn set_stack(&mut self, pid: Pid, stack: StackDesc) {
        self.get_mut(pid).stack = Some(stack);
    }

    pub(crate) fn is_configured(&self, pid: Pid) -> bool {
        self.get(pid).stack.is_some()
    }

    pub(crate) fn add_region(
        &mut self,
        pid: Pid,
        region: RegionDesc,
    ) -> Result<(), ()> {
        self.regions[pid.index()].push(region).map_err(|_| ())
    }

    pub(crate) fn region_table(&self, pid: Pid) -> &[RegionDesc] {
        &self.regions[pid.index()]
    }

    /// Sorts each process's grant table by base address and checks it for
    /// overlaps, so the one-pass coverage scan can trust it from here on.
    pub(crate) fn finalize_regions(&mut self) -> Result<(), ()> {
        for table in &mut self.regions {
            table.sort_unstable_by_key(|r| r.base);
            if !kerncore::regions_well_formed(table) {
                return Err(());
            }
        }
        Ok(())
    }

    /// Prepares every configured stack: sentinel fill, guard words at the
    /// low end, initial user stack pointer 16 bytes below the top.
    pub(crate) fn init_stacks(&mut self) {
        for index in 0..NUM_PROCESSES {
            let Some(stack) = self.procs[index].stack else {
                continue;
            };
            uassert!(stack.is_well_formed());
            let base = stack.base as *mut u32;
            // Safety: the configuration contract hands the stack region
            // over to the kernel exclusively, and well-formedness was
            // checked before we got here.
            unsafe {
                for word in 0..stack.size / 4 {
                    core::ptr::write_volatile(base.add(word), STACK_SENTINEL);
                }
                for (word, &guard) in STACK_GUARD.iter().enumerate() {
                    core::ptr::write_volatile(base.add(word), guard);
                }
            }
            self.procs[index].user_sp = stack.end() - 16;
        }
    }

    pub(crate) fn user_sp(&self, pid: Pid) -> usize {
        self.get(pid).user_sp
    }

    /// Unused stack headroom of `pid` in bytes: the sentinel fill still
    /// intact above the guard words.
    pub(crate) fn stack_reserve(&self, pid: Pid) -> usize {
        let Some(stack) = self.get(pid).stack else {
            return 0;
        };
        // Safety: the configuration contract hands the region to the
        // kernel exclusively, and init filled every word of it.
        let words = unsafe {
            core::slice::from_raw_parts(
                stack.base as *const u32,
                stack.size / 4,
            )
        };
        kerncore::stack_reserve_words(words, STACK_SENTINEL, STACK_GUARD.len())
            * 4
    }

    /// Stopped -> Running. Init orchestration only.
    pub(crate) fn release(&mut self, pid: Pid) {
        let p = self.get_mut(pid);
        p.state = ProcState::Running;
    }

    /// Running -> Stopped, idempotent. Tasks of the process stop at their
    /// next kernel-visible checkpoint.
    pub(crate) fn suspend(&mut self, pid: Pid) {
        let p = self.get_mut(pid);
        if p.state == ProcState::Running {
            klog!("process {} suspended", pid.0);
            p.state = ProcState::Stopped;
        }
    }

    /// Charges one abort to `pid`, in the total and in the per-cause
    /// counter. Runs in the dispatcher epilogue, which cannot overlap with
    /// itself for one process at one priority.
    pub(crate) fn count_abort(&mut self, pid: Pid, cause: AbortCause) {
        let p = self.get_mut(pid);
        p.total_aborts = p.total_aborts.saturating_add(1);
        let slot = &mut p.cause_aborts[cause.as_index()];
        *slot = slot.saturating_add(1);
    }

    pub(crate) fn total_failures(&self, pid: Pid) -> u32 {
        self.get(pid).total_aborts
    }

    pub(crate) fn failures(&self, pid: Pid, cause: AbortCause) -> u32 {
        self.get(pid).cause_aborts[cause.as_index()]
    }
}

/// Checks whether `pid` is currently suspended. Callable from any context,
/// including user tasks; it is a plain read.
pub fn is_process_suspended(pid: Pid) -> bool {
    arch::with_kernel(|k| k.procs.state(pid) == ProcState::Stopped)
}

/// Suspends `pid` from kernel context, unconditionally. Idempotent.
pub fn os_suspend_process(pid: Pid) {
    arch::with_kernel(|k| k.procs.suspend(pid));
}

/// Releases `pid` into Running state. Init orchestration only; calling
/// this on a started kernel is an invariant violation.
pub fn os_release_process(pid: Pid) {
    arch::with_kernel(|k| {
        if k.started {
            fail::die("os_release_process after kernel start");
        }
        k.procs.release(pid);
    });
}

/// Unused stack headroom of `pid` in bytes. The supervisory counterpart
/// to the failure counters: a reserve approaching zero means the process
/// is about to meet its guard words.
pub fn get_stack_reserve(pid: Pid) -> usize {
    arch::with_kernel(|k| k.procs.stack_reserve(pid))
}

/// Total aborts charged against `pid` since boot.
pub fn get_total_task_failures(pid: Pid) -> u32 {
    arch::with_kernel(|k| k.procs.total_failures(pid))
}

/// Aborts charged against `pid` for one particular cause since boot.
pub fn get_task_failures(pid: Pid, cause: AbortCause) -> u32 {
    arch::with_kernel(|k| k.procs.failures(pid, cause))
}

/// User entry point: suspend `target`, subject to the permission matrix.
/// A caller without the (caller, target) grant is aborted.
pub fn sc_suspend_process(target: Pid) {
    crate::syscalls::system_call(
        abi::Sysnum::SuspendProcess as u32,
        crate::syscalls::SysCallArgs::new([target.0 as usize, 0, 0, 0]),
    );
}

/// Handler for the suspend-process system call (Simple class).
pub(crate) fn sys_suspend_process(
    k: &mut crate::state::Kernel,
    caller: Pid,
    args: &crate::syscalls::SysCallArgs,
) -> Result<usize, crate::err::BadArgument> {
    let target = args.as_suspend_args().target();
    if !target.is_user() || !target.is_valid() {
        return Err(crate::err::BadArgument);
    }
    if !caller.is_user() || !k.procs.grants.allows(caller, target) {
        return Err(crate::err::BadArgument);
    }
    k.procs.suspend(target);
    Ok(0)
}
