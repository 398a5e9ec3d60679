// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! There is no ready queue anywhere in here. Each event owns one hardware
//! software-interrupt slot, wired at the event's priority; "activating" an
//! event is setting that slot's pending bit, and the interrupt controller
//! does the actual scheduling by vectoring to the highest-priority pending
//! slot. The kernel's share of the work is the 1 ms tick that pends due
//! cyclic events, the software-trigger path, and the per-slot handler
//! that runs the event's task list.
//!
//! Ties are deterministic for free: at equal priority the controller
//! serves the lower slot number first, and slots are assigned in event
//! creation order.

use abi::{EventId, Pid, Priority, KERNEL_PRIORITY, NUM_EVENTS};

use crate::descs::TaskDesc;
use crate::err::BadArgument;
use crate::state::Kernel;
use crate::syscalls::SysCallArgs;
use crate::{arch, dispatch, MAX_TASKS};

/// Runtime state of one event.
#[derive(Debug)]
pub(crate) struct Event {
    /// Period in ms; 0 for software-triggered only.
    pub(crate) period_ms: u32,
    /// Next due time in ms; meaningless while `period_ms` is 0.
    pub(crate) due_ms: u32,
    /// Priority of the slot this event is wired to.
    pub(crate) priority: Priority,
    /// Least PID allowed to software-trigger this event.
    pub(crate) min_trigger_pid: u8,
    /// Activations dropped because the slot was still pending. Saturating.
    pub(crate) loss: u32,
    /// This event's tasks: a range in the global task vector.
    pub(crate) tasks: (u16, u16),
}

/// The event table and the global task vector it indexes into.
pub(crate) struct EventTable {
    pub(crate) events: heapless::Vec<Event, NUM_EVENTS>,
    pub(crate) tasks: heapless::Vec<TaskDesc, MAX_TASKS>,
}

impl EventTable {
    pub(crate) fn new() -> Self {
        Self {
            events: heapless::Vec::new(),
            tasks: heapless::Vec::new(),
        }
    }

    fn task_range(&self, slot: usize) -> (u16, u16) {
        self.events[slot].tasks
    }
}

/// Marks due cyclic events pending. Runs at `KERNEL_PRIORITY` and is
/// never preempted by anything it schedules.
pub(crate) fn tick(k: &mut Kernel) {
    if !k.time.is_running() {
        return;
    }
    k.time.advance();
    let now = k.time.now_ms();
    for (slot, event) in k.events.events.iter_mut().enumerate() {
        if event.period_ms == 0 {
            continue;
        }
        if kerncore::is_due(event.due_ms, now) {
            if !arch::pend_sw_irq(slot) {
                // Previous activation still in flight; this one is lost.
                event.loss = event.loss.saturating_add(1);
            }
            event.due_ms = event.due_ms.wrapping_add(event.period_ms);
        }
    }
}

/// The periodic-timer interrupt. The platform invokes this once per
/// millisecond at `KERNEL_PRIORITY`; on the hosted port the test harness
/// (or a busy-waiting task) stands in for the timer.
///
/// Besides advancing time, the tick is the kernel-visible checkpoint that
/// bounds abort latency: a running task whose process was suspended, or
/// whose budget has run out, is torn down from here.
pub fn scheduler_tick() {
    let pending_abort = arch::with_kernel(|k| {
        let saved = arch::current_priority();
        arch::set_current_priority(KERNEL_PRIORITY);
        tick(k);
        arch::set_current_priority(saved);
        dispatch::checkpoint_cause(k)
    });
    if let Some(cause) = pending_abort {
        arch::abort_current_task(cause);
    }
    service_pending();
}

/// Serves pending software interrupts above the current priority until
/// none qualify, nesting the way the interrupt controller would. Entered
/// after every point that can raise a pending bit.
pub fn service_pending() {
    while let Some((slot, priority)) = arch::next_pending(arch::current_priority())
    {
        let saved = arch::current_priority();
        arch::set_current_priority(priority);
        service_event(slot);
        arch::set_current_priority(saved);
    }
}

/// The software-interrupt handler shared by all event slots: run the
/// event's tasks in registration order, then clear the pending bit to
/// re-arm the slot.
fn service_event(slot: usize) {
    let (start, end) = arch::with_kernel(|k| k.events.task_range(slot));
    klog!("event {} activated, tasks {}..{}", slot, start, end);
    for index in start..end {
        // A higher-priority slot may have pended while the previous task
        // ran; the controller would have preempted, so serve it first.
        service_pending();
        let task = arch::with_kernel(|k| k.events.tasks[index as usize]);
        if task.pid.is_user() {
            let code = dispatch::run_event_task(&task, slot as u32);
            if code < 0 {
                klog!("event {} task {} aborted: {}", slot, index, code);
            }
        } else {
            // Kernel task: plain call, supervisor state, no containment.
            let code = (task.entry)(slot as u32);
            if code < 0 {
                klog!("event {} kernel task {} returned {}", slot, index, code);
            }
        }
    }
    arch::clear_sw_irq(slot);
}

/// The software-trigger primitive. Within a critical section: if the
/// slot is idle, pend it and report activation; if it is still pending,
/// drop the activation and count the loss.
pub(crate) fn trigger(k: &mut Kernel, id: EventId) -> bool {
    arch::with_irqs_disabled(|| {
        if arch::pend_sw_irq(id.index()) {
            true
        } else {
            let event = &mut k.events.events[id.index()];
            event.loss = event.loss.saturating_add(1);
            false
        }
    })
}

/// Triggers `id` from kernel context. Returns whether an activation was
/// produced (as opposed to lost). Misnaming an event from kernel code is
/// a kernel bug, not a countable failure.
pub fn trigger_event(id: EventId) -> bool {
    let activated = arch::with_kernel(|k| {
        uassert!(id.index() < k.events.events.len());
        trigger(k, id)
    });
    service_pending();
    activated
}

/// User entry point for [`trigger_event`]. The caller is aborted if the
/// event does not exist or its PID is below the event's trigger
/// threshold.
pub fn sc_trigger_event(id: EventId) -> bool {
    crate::syscalls::system_call(
        abi::Sysnum::TriggerEvent as u32,
        SysCallArgs::new([id.0 as usize, 0, 0, 0]),
    ) != 0
}

/// Handler for the trigger-event system call (Full class).
pub(crate) fn sys_trigger_event(
    caller: Pid,
    args: &SysCallArgs,
) -> Result<usize, BadArgument> {
    let id = args.as_trigger_args().event();
    arch::with_kernel(|k| {
        if id >= k.events.events.len() {
            return Err(BadArgument);
        }
        if caller.0 < k.events.events[id].min_trigger_pid {
            return Err(BadArgument);
        }
        Ok(trigger(k, EventId(id as u8)) as usize)
    })
}

/// Activations of `id` lost so far because a previous one was still in
/// flight.
pub fn get_no_activation_loss(id: EventId) -> u32 {
    arch::with_kernel(|k| k.events.events[id.index()].loss)
}

/// Kernel time in milliseconds since start.
pub fn system_time_ms() -> u32 {
    arch::with_kernel(|k| k.time.now_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcTable;

    fn idle(_: u32) -> i32 {
        0
    }

    fn kernel_with_events(specs: &[(u32, u32, u8)]) -> Kernel {
        let mut events = EventTable::new();
        for &(period, first, prio) in specs {
            let start = events.tasks.len() as u16;
            events
                .tasks
                .push(TaskDesc {
                    entry: idle,
                    budget: 0,
                    pid: Pid::KERNEL,
                })
                .unwrap();
            events
                .events
                .push(Event {
                    period_ms: period,
                    due_ms: first,
                    priority: Priority(prio),
                    min_trigger_pid: 0,
                    loss: 0,
                    tasks: (start, start + 1),
                })
                .unwrap();
        }
        let mut k = Kernel::new(events, ProcTable::new());
        k.time.start();
        k
    }

    // Direct tick tests run on a bare Kernel value; the pend bits still
    // live in the simulated controller, which is per-thread and starts
    // clear.

    #[test]
    fn tick_pends_due_events_and_advances_due() {
        let mut k = kernel_with_events(&[(10, 10, 3)]);
        for _ in 0..9 {
            tick(&mut k);
            assert!(!arch::sw_irq_pending(0));
        }
        tick(&mut k);
        assert!(arch::sw_irq_pending(0));
        assert_eq!(k.events.events[0].due_ms, 20);
        assert_eq!(k.events.events[0].loss, 0);
        arch::clear_sw_irq(0);
    }

    #[test]
    fn tick_counts_losses_while_pending() {
        let mut k = kernel_with_events(&[(5, 5, 3)]);
        for _ in 0..5 {
            tick(&mut k);
        }
        assert!(arch::sw_irq_pending(0));
        // Nothing serves the slot; the next due time must lose.
        for _ in 0..5 {
            tick(&mut k);
        }
        assert_eq!(k.events.events[0].loss, 1);
        assert_eq!(k.events.events[0].due_ms, 15);
        arch::clear_sw_irq(0);
    }

    #[test]
    fn software_only_events_ignore_the_tick() {
        let mut k = kernel_with_events(&[(0, 0, 3)]);
        for _ in 0..50 {
            tick(&mut k);
        }
        assert!(!arch::sw_irq_pending(0));
    }

    #[test]
    fn trigger_reports_and_counts_losses() {
        let mut k = kernel_with_events(&[(0, 0, 3)]);
        assert!(trigger(&mut k, EventId(0)));
        assert!(!trigger(&mut k, EventId(0)));
        assert!(!trigger(&mut k, EventId(0)));
        assert_eq!(k.events.events[0].loss, 2);
        arch::clear_sw_irq(0);
        assert!(trigger(&mut k, EventId(0)));
        arch::clear_sw_irq(0);
    }

    #[test]
    fn loss_counter_saturates() {
        let mut k = kernel_with_events(&[(0, 0, 3)]);
        k.events.events[0].loss = u32::MAX - 1;
        assert!(trigger(&mut k, EventId(0)));
        for _ in 0..3 {
            assert!(!trigger(&mut k, EventId(0)));
        }
        assert_eq!(k.events.events[0].loss, u32::MAX);
        arch::clear_sw_irq(0);
    }
}
