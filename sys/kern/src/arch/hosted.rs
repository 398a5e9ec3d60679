// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted simulation port.
//!
//! This port runs the kernel as an ordinary library inside a host process,
//! primarily to let the test suite drive it. The machine is modeled per
//! thread:
//!
//! - the interrupt controller is a byte of pending bits plus a priority
//!   wiring table, served highest priority first and lowest slot first on
//!   ties, exactly like the hardware arbiter;
//! - the timebase is a counter advanced explicitly (see
//!   [`advance_timebase`] and [`busy_wait_ms`]) -- simulated time only
//!   passes when some test or task says so;
//! - the periodic timer does not fire on its own; tests call
//!   [`crate::sched::scheduler_tick`] for each elapsed millisecond;
//! - the supervisor/user privilege transition is a plain call, and the
//!   abort path uses a typed unwind payload caught at the dispatcher
//!   epilogue, standing in for the trap-vector continuation jump.
//!
//! Kernel-visible checkpoints in this port are task entry, every system
//! call, every simulated tick, and task return. Hardware ports add
//! arbitrary instruction boundaries; the observable abort contract is the
//! same.

use core::cell::Cell;
use core::ptr::NonNull;
use std::any::Any;

use abi::{AbortCause, Priority, NUM_EVENTS};

use crate::state::Kernel;

/// Kernel trace logging, routed into the `log` facade on this port.
/// Hardware ports compile this down to nothing unless a debug channel is
/// wired up.
macro_rules! klog {
    ($($args:tt)*) => {
        log::trace!($($args)*)
    };
}

/// Kernel-internal assertion.
macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Timebase ticks per millisecond of simulated time. Budgets and
/// busy-waits in tests are converted with this.
pub const TIMEBASE_TICKS_PER_MS: u64 = 1_000;

/// Converts a millisecond figure into an execution-time budget in timebase
/// ticks.
pub const fn budget_for_ms(ms: u32) -> u32 {
    ms * TIMEBASE_TICKS_PER_MS as u32
}

struct SimState {
    /// Anchor for kernel state. `with_kernel` takes the pointer out for
    /// the duration of the borrow, so reentering kernel state while it is
    /// already borrowed shows up as a hard failure instead of aliasing.
    kernel: Cell<Option<NonNull<Kernel>>>,
    /// Current-priority register of the interrupt controller.
    current_priority: Cell<u8>,
    /// External-interrupt-enable bit.
    irq_enable: Cell<bool>,
    /// Software-interrupt pending bits, one per slot.
    pending: Cell<u8>,
    /// Priority-select wiring for each software-interrupt slot.
    slot_priority: Cell<[u8; NUM_EVENTS]>,
    /// Free-running timebase counter.
    timebase: Cell<u64>,
}

std::thread_local! {
    static SIM: SimState = SimState {
        kernel: Cell::new(None),
        current_priority: Cell::new(0),
        irq_enable: Cell::new(false),
        pending: Cell::new(0),
        slot_priority: Cell::new([0; NUM_EVENTS]),
        timebase: Cell::new(0),
    };
}

/// Resets the simulated machine to its power-on state. Invoked when a
/// kernel is installed, so consecutive kernels on one thread don't inherit
/// stale interrupt state.
fn reset_machine() {
    SIM.with(|s| {
        s.current_priority.set(0);
        s.irq_enable.set(false);
        s.pending.set(0);
        s.slot_priority.set([0; NUM_EVENTS]);
        s.timebase.set(0);
    });
}

/// Installs `kernel` as this thread's kernel state.
///
/// # Safety
///
/// The pointer must stay valid, and not be used through any other path,
/// until [`uninstall_kernel`] runs. The startup code upholds this by
/// owning the state in a pinned heap allocation for the life of the
/// returned handle.
pub(crate) unsafe fn install_kernel(kernel: NonNull<Kernel>) {
    SIM.with(|s| {
        if s.kernel.get().is_some() {
            crate::fail::die("second kernel installed on one core");
        }
        s.kernel.set(Some(kernel));
    });
    reset_machine();
}

/// Tears down the anchor set by [`install_kernel`].
pub(crate) fn uninstall_kernel() {
    SIM.with(|s| s.kernel.set(None));
}

/// Runs `f` with exclusive access to kernel state.
///
/// The anchor is emptied for the duration of the call, so nested use --
/// which would mean a trap handler interrupting the kernel itself, or a
/// borrow leaked across a user-code call -- dies instead of aliasing.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    struct Restore(NonNull<Kernel>);
    impl Drop for Restore {
        fn drop(&mut self) {
            SIM.with(|s| s.kernel.set(Some(self.0)));
        }
    }

    let Some(mut ptr) = SIM.with(|s| s.kernel.take()) else {
        crate::fail::die("kernel state unavailable or reentered");
    };
    // Restore on unwind too: the abort path throws through here.
    let _restore = Restore(ptr);
    // Safety: install_kernel's contract gives validity; the take() above
    // gives exclusivity.
    let kernel = unsafe { ptr.as_mut() };
    f(kernel)
}

/// Reads the current-priority register.
pub fn current_priority() -> Priority {
    SIM.with(|s| Priority(s.current_priority.get()))
}

/// Writes the current-priority register.
pub fn set_current_priority(p: Priority) {
    SIM.with(|s| s.current_priority.set(p.0));
}

/// Sets the external-interrupt-enable bit. Called once at the end of
/// kernel init; before this, nothing is served.
pub fn enable_interrupts() {
    SIM.with(|s| s.irq_enable.set(true));
}

/// Critical section: save+disable of the external-interrupt-enable bit
/// around `f`, restoring the saved value afterwards. Reentrant by
/// construction.
pub fn with_irqs_disabled<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);
    impl Drop for Restore {
        fn drop(&mut self) {
            SIM.with(|s| s.irq_enable.set(self.0));
        }
    }

    let saved = SIM.with(|s| s.irq_enable.replace(false));
    let _restore = Restore(saved);
    f()
}

/// Programs the priority-select register for one software-interrupt slot.
pub fn wire_sw_irq(slot: usize, priority: Priority) {
    uassert!(slot < NUM_EVENTS);
    SIM.with(|s| {
        let mut prios = s.slot_priority.get();
        prios[slot] = priority.0;
        s.slot_priority.set(prios);
    });
}

/// Attempts to set the pending bit of a software-interrupt slot. Returns
/// `false` without side effect if the bit was already set. Set and
/// completion-clear are one indivisible store on the real controller; the
/// single `Cell` update models that.
pub fn pend_sw_irq(slot: usize) -> bool {
    uassert!(slot < NUM_EVENTS);
    SIM.with(|s| {
        let pending = s.pending.get();
        if pending & (1 << slot) != 0 {
            false
        } else {
            s.pending.set(pending | (1 << slot));
            true
        }
    })
}

/// Clears the pending bit of a software-interrupt slot, re-arming it.
pub fn clear_sw_irq(slot: usize) {
    uassert!(slot < NUM_EVENTS);
    SIM.with(|s| {
        let pending = s.pending.get();
        s.pending.set(pending & !(1 << slot));
    });
}

/// Reads the pending bit of a software-interrupt slot.
pub fn sw_irq_pending(slot: usize) -> bool {
    uassert!(slot < NUM_EVENTS);
    SIM.with(|s| s.pending.get() & (1 << slot) != 0)
}

/// Picks the software interrupt the controller would vector to next: the
/// highest-priority pending slot strictly above `above`, lowest slot number
/// first at equal priority. Returns `None` when nothing qualifies or when
/// external interrupts are disabled.
pub fn next_pending(above: Priority) -> Option<(usize, Priority)> {
    SIM.with(|s| {
        if !s.irq_enable.get() {
            return None;
        }
        let pending = s.pending.get();
        let prios = s.slot_priority.get();
        let mut best: Option<(usize, Priority)> = None;
        for slot in 0..NUM_EVENTS {
            if pending & (1 << slot) == 0 {
                continue;
            }
            let p = Priority(prios[slot]);
            if !p.is_more_important_than(above) {
                continue;
            }
            if let Some((_, bp)) = best {
                if !p.is_more_important_than(bp) {
                    continue;
                }
            }
            best = Some((slot, p));
        }
        best
    })
}

/// Installs the scheduler tick source. On this port the timer never fires
/// by itself; the test harness stands in for it.
pub fn install_tick(priority: Priority) {
    klog!("tick source installed at priority {}", priority.0);
}

/// Starts the periodic timer. Bookkeeping only here; the kernel's tick
/// step is what actually gates time.
pub fn start_tick() {
    klog!("tick started");
}

/// Reads the free-running timebase counter.
pub fn timebase() -> u64 {
    SIM.with(|s| s.timebase.get())
}

/// Advances the simulated timebase. This is how tests charge execution
/// time to the running task.
pub fn advance_timebase(ticks: u64) {
    SIM.with(|s| {
        let t = s.timebase.get();
        s.timebase.set(t.wrapping_add(ticks));
    });
}

/// Burns `ms` milliseconds of simulated wall time from inside a task,
/// letting the periodic timer fire for each elapsed millisecond -- so
/// higher-priority work preempts, due events pend (or lose activations),
/// and deadline/suspension checks run, as they would on hardware.
pub fn busy_wait_ms(ms: u32) {
    for _ in 0..ms {
        advance_timebase(TIMEBASE_TICKS_PER_MS);
        crate::sched::scheduler_tick();
    }
}

/// Unwind payload of the task abort path.
///
/// On hardware the abort epilogue is reached by the trap vectors jumping
/// to a continuation saved in the activation frame; here the same edge is
/// a typed panic caught in [`call_user`]'s frame.
#[derive(Debug)]
pub(crate) enum TaskAbort {
    /// Torn down by the kernel for the given cause.
    Cause(AbortCause),
    /// Ended voluntarily through the terminate-task system call.
    Terminate(i32),
}

/// Unwind payload of the kernel-fatal path. Never caught by the dispatcher;
/// it unwinds out of the whole simulated machine.
pub(crate) struct KernelFatal(pub String);

/// Enters a task function in (simulated) user state.
///
/// Returns the task's own result, or the abort that ended it. A panic
/// that is not one of ours is treated like a trap taken in user state --
/// an assertion failing in user code -- while kernel-fatal payloads keep
/// unwinding.
pub(crate) fn call_user(
    entry: fn(u32) -> i32,
    param: u32,
) -> Result<i32, TaskAbort> {
    let outcome = std::panic::catch_unwind(move || entry(param));
    match outcome {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<TaskAbort>() {
            Ok(abort) => Err(*abort),
            Err(payload) => {
                if payload.is::<KernelFatal>() {
                    std::panic::resume_unwind(payload)
                }
                Err(TaskAbort::Cause(AbortCause::Trap))
            }
        },
    }
}

fn throw(payload: impl Any + Send + 'static) -> ! {
    std::panic::resume_unwind(Box::new(payload))
}

/// Aborts the task currently in user state, for `cause`. Does not return;
/// control resurfaces in the dispatcher epilogue.
pub(crate) fn abort_current_task(cause: AbortCause) -> ! {
    throw(TaskAbort::Cause(cause))
}

/// Ends the task currently in user state with `result`, as the
/// terminate-task system call does.
pub(crate) fn terminate_current_task(result: i32) -> ! {
    throw(TaskAbort::Terminate(result))
}

/// Halts the machine. On this port the halt surfaces as an unwind carrying
/// the epitaph, so a test harness can observe the death.
pub(crate) fn halt() -> ! {
    throw(KernelFatal(crate::fail::epitaph()))
}

/// An 8-byte-aligned buffer standing in for a process stack region from
/// the link map. Keep it alive as long as the kernel uses it.
pub struct SimStack {
    buf: Box<[u64]>,
}

impl SimStack {
    pub fn new(size_bytes: usize) -> Self {
        uassert!(size_bytes % 8 == 0);
        Self {
            buf: vec![0u64; size_bytes / 8].into_boxed_slice(),
        }
    }

    /// The stack region this buffer provides, as configuration input.
    pub fn desc(&self) -> crate::descs::StackDesc {
        crate::descs::StackDesc {
            base: self.buf.as_ptr() as usize,
            size: self.buf.len() * 8,
        }
    }

    /// Reads a word of the stack region, for inspecting the sentinel fill
    /// and guard area in tests.
    pub fn word(&self, index: usize) -> u32 {
        let ptr = self.buf.as_ptr() as *const u32;
        uassert!(index < self.buf.len() * 2);
        // Safety: in bounds per the assert; the buffer is plain memory.
        unsafe { core::ptr::read_volatile(ptr.add(index)) }
    }
}
