// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel configuration and startup.
//!
//! An application is declared against a [`Config`]: events, tasks, init
//! tasks, process stacks, memory grants, suspend permissions. Nothing
//! validated here trickles in later -- [`Config::init_kernel`] checks the
//! whole shape, refuses to start on any inconsistency, and otherwise
//! brings the system up in one pass:
//!
//! 1. process stacks are prepared (sentinel fill, guard words, initial
//!    stack pointer);
//! 2. every event is wired to its software-interrupt slot at its declared
//!    priority, and the scheduler claims the periodic timer at
//!    `KERNEL_PRIORITY`;
//! 3. external interrupts are enabled;
//! 4. init tasks run to completion, kernel first, then processes in
//!    rising PID order, so more privileged setup can override less;
//! 5. configured processes are released and the tick is started.

use core::ptr::NonNull;

use abi::{
    EventId, Pid, KERNEL_PRIORITY, MAX_TASK_BUDGET, NUM_EVENTS,
    NUM_PROCESSES, UNBLOCKABLE_PRIORITY,
};

use crate::descs::{
    EventDesc, RegionAttributes, RegionDesc, StackDesc, TaskDesc,
};
use crate::err::ConfigError;
use crate::proc::{ProcTable, SuspendMatrix};
use crate::sched::{Event, EventTable};
use crate::state::Kernel;
use crate::{arch, dispatch, MAX_TASKS, REGIONS_PER_PROCESS};

/// The static application configuration, assembled before start.
pub struct Config {
    events: heapless::Vec<EventDesc, NUM_EVENTS>,
    /// Task registrations in call order; grouped per event at start.
    registrations: heapless::Vec<(EventId, TaskDesc), MAX_TASKS>,
    /// One optional init task per process, index 0 being the kernel's.
    init_tasks: [Option<TaskDesc>; NUM_PROCESSES + 1],
    stacks: [Option<StackDesc>; NUM_PROCESSES],
    regions: heapless::Vec<(Pid, RegionDesc), { NUM_PROCESSES * REGIONS_PER_PROCESS }>,
    grants: SuspendMatrix,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            events: heapless::Vec::new(),
            registrations: heapless::Vec::new(),
            init_tasks: [None; NUM_PROCESSES + 1],
            stacks: [None; NUM_PROCESSES],
            regions: heapless::Vec::new(),
            grants: SuspendMatrix::default(),
        }
    }

    /// Declares an event. Ids are issued densely from 0, in call order,
    /// which also fixes the tie-break order at equal priority.
    pub fn create_event(
        &mut self,
        desc: EventDesc,
    ) -> Result<EventId, ConfigError> {
        if desc.priority == abi::Priority(0)
            || !KERNEL_PRIORITY.is_more_important_than(desc.priority)
        {
            return Err(ConfigError::BadEventPriority);
        }
        if !kerncore::time_field_ok(desc.period_ms)
            || !kerncore::time_field_ok(desc.first_activation_ms)
        {
            return Err(ConfigError::BadEventTime);
        }
        if desc.period_ms == 0 && desc.first_activation_ms != 0 {
            return Err(ConfigError::BadEventTime);
        }
        if desc.min_trigger_pid > NUM_PROCESSES as u8 + 1 {
            return Err(ConfigError::BadTriggerPid);
        }
        let id = EventId(self.events.len() as u8);
        self.events
            .push(desc)
            .map_err(|_| ConfigError::EventTableFull)?;
        Ok(id)
    }

    fn check_task(&self, task: &TaskDesc) -> Result<(), ConfigError> {
        if !task.pid.is_valid() {
            return Err(ConfigError::BadPid);
        }
        if task.budget > MAX_TASK_BUDGET {
            return Err(ConfigError::BudgetTooLarge);
        }
        if !task.pid.is_user() && task.budget != 0 {
            return Err(ConfigError::OsTaskWithBudget);
        }
        Ok(())
    }

    /// Registers a task against an event. Tasks of one event run in
    /// registration order on each activation.
    pub fn register_task(
        &mut self,
        event: EventId,
        task: TaskDesc,
    ) -> Result<(), ConfigError> {
        if event.index() >= self.events.len() {
            return Err(ConfigError::UnknownEvent);
        }
        self.check_task(&task)?;
        self.registrations
            .push((event, task))
            .map_err(|_| ConfigError::TaskTableFull)
    }

    /// Registers a process's init task, run once during kernel start and
    /// never scheduled afterwards. One per process, the kernel included.
    pub fn register_init_task(
        &mut self,
        task: TaskDesc,
    ) -> Result<(), ConfigError> {
        self.check_task(&task)?;
        let slot = &mut self.init_tasks[task.pid.0 as usize];
        if slot.is_some() {
            return Err(ConfigError::DuplicateInitTask);
        }
        *slot = Some(task);
        Ok(())
    }

    /// Provides a process's stack region, normally from the link map.
    pub fn set_process_stack(
        &mut self,
        pid: Pid,
        stack: StackDesc,
    ) -> Result<(), ConfigError> {
        if !pid.is_user() || !pid.is_valid() {
            return Err(ConfigError::BadPid);
        }
        self.stacks[pid.index()] = Some(stack);
        Ok(())
    }

    /// Grants a process an extra memory region for the MPU and the
    /// user-pointer predicates. The stack is granted automatically.
    pub fn add_memory_region(
        &mut self,
        pid: Pid,
        region: RegionDesc,
    ) -> Result<(), ConfigError> {
        if !pid.is_user() || !pid.is_valid() {
            return Err(ConfigError::BadPid);
        }
        self.regions
            .push((pid, region))
            .map_err(|_| ConfigError::RegionBad)
    }

    /// Grants `caller` the right to suspend `target` through the system
    /// call. Whether the grant is even legal is judged at `init_kernel`,
    /// when the supervisory process is known.
    pub fn grant_permission_suspend_process(
        &mut self,
        caller: Pid,
        target: Pid,
    ) -> Result<(), ConfigError> {
        if !caller.is_user()
            || !caller.is_valid()
            || !target.is_user()
            || !target.is_valid()
        {
            return Err(ConfigError::BadPid);
        }
        self.grants.grant(caller, target);
        Ok(())
    }

    fn uses_process(&self, pid: Pid) -> bool {
        self.registrations.iter().any(|(_, t)| t.pid == pid)
            || self.init_tasks[pid.0 as usize].is_some()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // Stacks: shape first, then mutual overlap.
        let mut stack_list: heapless::Vec<StackDesc, NUM_PROCESSES> =
            heapless::Vec::new();
        for stack in self.stacks.iter().flatten() {
            if !stack.is_well_formed() {
                return Err(ConfigError::StackBad);
            }
            stack_list.push(*stack).ok();
        }
        stack_list.sort_unstable_by_key(|s| s.base);
        for pair in stack_list.windows(2) {
            if pair[1].base < pair[0].end() {
                return Err(ConfigError::StackBad);
            }
        }

        // Every user task needs a configured process; every configured
        // process needs a reason to exist.
        for (_, task) in &self.registrations {
            if task.pid.is_user() && self.stacks[task.pid.index()].is_none() {
                return Err(ConfigError::ProcessNotConfigured);
            }
        }
        for pid in (1..=NUM_PROCESSES as u8).map(Pid) {
            if let Some(task) = &self.init_tasks[pid.0 as usize] {
                debug_assert_eq!(task.pid, pid);
                if self.stacks[pid.index()].is_none() {
                    return Err(ConfigError::ProcessNotConfigured);
                }
            }
            if self.stacks[pid.index()].is_some() && !self.uses_process(pid) {
                return Err(ConfigError::ProcessUnused);
            }
        }

        // No event may start with an empty task list.
        for id in 0..self.events.len() {
            let id = EventId(id as u8);
            if !self.registrations.iter().any(|(e, _)| *e == id) {
                return Err(ConfigError::EventWithoutTask);
            }
        }

        // The unblockable tier is for the supervisory process (and kernel
        // tasks) only; anything else there could never be shut out by
        // the ceiling protocol, defeating its reservation.
        let supervisory = (1..=NUM_PROCESSES as u8)
            .rev()
            .map(Pid)
            .find(|pid| self.stacks[pid.index()].is_some());
        for (event, task) in &self.registrations {
            let prio = self.events[event.index()].priority;
            if prio == UNBLOCKABLE_PRIORITY
                && task.pid.is_user()
                && Some(task.pid) != supervisory
            {
                return Err(ConfigError::UnblockableTierViolation);
            }
        }

        // Nobody may hold the right to suspend the supervisory process.
        if let Some(sup) = supervisory {
            if self.grants.granted_targets() & (1 << sup.index()) != 0 {
                return Err(ConfigError::SuspendGrantBad);
            }
        }

        Ok(())
    }

    fn build_kernel(&self) -> Result<Kernel, ConfigError> {
        let mut procs = ProcTable::new();
        for pid in (1..=NUM_PROCESSES as u8).map(Pid) {
            let Some(stack) = self.stacks[pid.index()] else {
                continue;
            };
            procs.set_stack(pid, stack);
            // The stack is a grant like any other.
            procs
                .add_region(
                    pid,
                    RegionDesc {
                        base: stack.base,
                        size: stack.size,
                        attributes: RegionAttributes::READ
                            | RegionAttributes::WRITE,
                    },
                )
                .map_err(|_| ConfigError::RegionBad)?;
        }
        for (pid, region) in &self.regions {
            procs
                .add_region(*pid, *region)
                .map_err(|_| ConfigError::RegionBad)?;
        }
        procs.finalize_regions().map_err(|_| ConfigError::RegionBad)?;
        procs.grants = self.grants.clone();

        let mut events = EventTable::new();
        for (id, desc) in self.events.iter().enumerate() {
            let start = events.tasks.len() as u16;
            for (event, task) in &self.registrations {
                if event.index() == id {
                    events.tasks.push(*task).ok();
                }
            }
            let end = events.tasks.len() as u16;
            events
                .events
                .push(Event {
                    period_ms: desc.period_ms,
                    due_ms: desc.first_activation_ms,
                    priority: desc.priority,
                    min_trigger_pid: desc.min_trigger_pid,
                    loss: 0,
                    tasks: (start, end),
                })
                .ok();
        }

        Ok(Kernel::new(events, procs))
    }

    /// Validates the configuration and starts the kernel.
    ///
    /// On success the returned handle owns the running kernel; dropping
    /// it shuts the simulated machine down. On error nothing has been
    /// started and nothing is left installed.
    pub fn init_kernel(self) -> Result<KernelHandle, ConfigError> {
        self.validate()?;

        let mut kernel = Box::new(self.build_kernel()?);
        kernel.procs.init_stacks();

        // From here the kernel is reachable from trap context; failures
        // below unwind through the handle and deinstall.
        let handle = KernelHandle::install(kernel);

        klog!("kernel init: wiring {} events", self.events.len());
        for (slot, desc) in self.events.iter().enumerate() {
            arch::wire_sw_irq(slot, desc.priority);
        }
        arch::install_tick(KERNEL_PRIORITY);
        arch::enable_interrupts();

        // Init tasks: kernel first, then rising PID, so the more
        // privileged run later and may override what the less privileged
        // set up.
        if let Some(task) = &self.init_tasks[0] {
            let code = (task.entry)(0);
            if code < 0 {
                return Err(ConfigError::InitTaskFailed {
                    pid: Pid::KERNEL,
                    code,
                });
            }
        }
        for pid in (1..=NUM_PROCESSES as u8).map(Pid) {
            if let Some(task) = &self.init_tasks[pid.0 as usize] {
                let code = dispatch::run_init_task(task, pid.0 as u32);
                if code < 0 {
                    return Err(ConfigError::InitTaskFailed { pid, code });
                }
            }
        }

        arch::with_kernel(|k| {
            for pid in (1..=NUM_PROCESSES as u8).map(Pid) {
                if k.procs.is_configured(pid) {
                    k.procs.release(pid);
                }
            }
            k.time.start();
            k.started = true;
        });
        arch::start_tick();
        klog!("kernel started");

        Ok(handle)
    }
}

/// Owner of a running kernel on the hosted port. Keeps the state alive
/// and anchored for the platform; dropping it uninstalls the kernel.
pub struct KernelHandle {
    _kernel: Box<Kernel>,
}

impl KernelHandle {
    fn install(mut kernel: Box<Kernel>) -> Self {
        let ptr = NonNull::from(&mut *kernel);
        // Safety: the box is owned by the handle and never moved out or
        // touched through it; the heap allocation outlives the install.
        unsafe {
            arch::install_kernel(ptr);
        }
        Self { _kernel: kernel }
    }
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        arch::uninstall_kernel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descs::TaskDesc;
    use abi::Priority;

    fn nop(_: u32) -> i32 {
        0
    }

    fn failing_init(_: u32) -> i32 {
        // Dispatched init tasks report failure by returning negative; the
        // dispatcher normalizes that to the UserAbort code.
        -7
    }

    fn sw_event(priority: u8) -> EventDesc {
        EventDesc {
            period_ms: 0,
            first_activation_ms: 0,
            priority: Priority(priority),
            min_trigger_pid: 0,
        }
    }

    fn task(pid: u8) -> TaskDesc {
        TaskDesc {
            entry: nop,
            budget: 0,
            pid: Pid(pid),
        }
    }

    #[test]
    fn event_validation() {
        let mut cfg = Config::new();
        assert_eq!(
            cfg.create_event(sw_event(0)).unwrap_err(),
            ConfigError::BadEventPriority
        );
        assert_eq!(
            cfg.create_event(sw_event(KERNEL_PRIORITY.0)).unwrap_err(),
            ConfigError::BadEventPriority
        );
        assert_eq!(
            cfg.create_event(EventDesc {
                period_ms: 0x4000_0000,
                ..sw_event(3)
            })
            .unwrap_err(),
            ConfigError::BadEventTime
        );
        assert_eq!(
            cfg.create_event(EventDesc {
                first_activation_ms: 5,
                ..sw_event(3)
            })
            .unwrap_err(),
            ConfigError::BadEventTime
        );
        assert_eq!(
            cfg.create_event(EventDesc {
                min_trigger_pid: NUM_PROCESSES as u8 + 2,
                ..sw_event(3)
            })
            .unwrap_err(),
            ConfigError::BadTriggerPid
        );

        // Ids are dense, and the unblockable tier is a legal event
        // priority.
        for expect in 0..NUM_EVENTS as u8 {
            let id = cfg.create_event(sw_event(UNBLOCKABLE_PRIORITY.0)).unwrap();
            assert_eq!(id, EventId(expect));
        }
        assert_eq!(
            cfg.create_event(sw_event(3)).unwrap_err(),
            ConfigError::EventTableFull
        );
    }

    #[test]
    fn task_validation() {
        let mut cfg = Config::new();
        let ev = cfg.create_event(sw_event(3)).unwrap();
        assert_eq!(
            cfg.register_task(EventId(7), task(1)).unwrap_err(),
            ConfigError::UnknownEvent
        );
        assert_eq!(
            cfg.register_task(ev, task(NUM_PROCESSES as u8 + 1))
                .unwrap_err(),
            ConfigError::BadPid
        );
        assert_eq!(
            cfg.register_task(
                ev,
                TaskDesc {
                    budget: MAX_TASK_BUDGET + 1,
                    ..task(1)
                }
            )
            .unwrap_err(),
            ConfigError::BudgetTooLarge
        );
        assert_eq!(
            cfg.register_task(
                ev,
                TaskDesc {
                    budget: 100,
                    ..task(0)
                }
            )
            .unwrap_err(),
            ConfigError::OsTaskWithBudget
        );
        cfg.register_task(ev, task(1)).unwrap();

        cfg.register_init_task(task(1)).unwrap();
        assert_eq!(
            cfg.register_init_task(task(1)).unwrap_err(),
            ConfigError::DuplicateInitTask
        );
    }

    #[test]
    fn whole_config_validation() {
        use crate::arch::SimStack;

        // Event with no tasks.
        let mut cfg = Config::new();
        cfg.create_event(sw_event(3)).unwrap();
        assert_eq!(
            cfg.init_kernel().err(),
            Some(ConfigError::EventWithoutTask)
        );

        // Task in a process with no stack.
        let mut cfg = Config::new();
        let ev = cfg.create_event(sw_event(3)).unwrap();
        cfg.register_task(ev, task(2)).unwrap();
        assert_eq!(
            cfg.init_kernel().err(),
            Some(ConfigError::ProcessNotConfigured)
        );

        // Stack with no tasks.
        let stack = SimStack::new(512);
        let mut cfg = Config::new();
        let ev = cfg.create_event(sw_event(3)).unwrap();
        cfg.register_task(ev, task(0)).unwrap();
        cfg.set_process_stack(Pid(1), stack.desc()).unwrap();
        assert_eq!(cfg.init_kernel().err(), Some(ConfigError::ProcessUnused));

        // Misshapen stack.
        let mut cfg = Config::new();
        let ev = cfg.create_event(sw_event(3)).unwrap();
        cfg.register_task(ev, task(1)).unwrap();
        cfg.set_process_stack(
            Pid(1),
            StackDesc {
                base: 0x1004,
                size: 512,
            },
        )
        .unwrap();
        assert_eq!(cfg.init_kernel().err(), Some(ConfigError::StackBad));

        // Overlapping stacks.
        let stack = SimStack::new(512);
        let mut half = stack.desc();
        half.size = 256;
        let mut cfg = Config::new();
        let ev = cfg.create_event(sw_event(3)).unwrap();
        cfg.register_task(ev, task(1)).unwrap();
        cfg.register_task(ev, task(2)).unwrap();
        cfg.set_process_stack(Pid(1), stack.desc()).unwrap();
        cfg.set_process_stack(Pid(2), half).unwrap();
        assert_eq!(cfg.init_kernel().err(), Some(ConfigError::StackBad));
    }

    #[test]
    fn unblockable_tier_and_grant_validation() {
        use crate::arch::SimStack;

        // A mid-privilege task on an unblockable event.
        let s1 = SimStack::new(512);
        let s3 = SimStack::new(512);
        let mut cfg = Config::new();
        let ev = cfg
            .create_event(sw_event(UNBLOCKABLE_PRIORITY.0))
            .unwrap();
        cfg.register_task(ev, task(1)).unwrap();
        cfg.register_task(ev, task(3)).unwrap();
        cfg.set_process_stack(Pid(1), s1.desc()).unwrap();
        cfg.set_process_stack(Pid(3), s3.desc()).unwrap();
        assert_eq!(
            cfg.init_kernel().err(),
            Some(ConfigError::UnblockableTierViolation)
        );

        // Grant aimed at the supervisory process.
        let s1 = SimStack::new(512);
        let s3 = SimStack::new(512);
        let mut cfg = Config::new();
        let ev = cfg.create_event(sw_event(3)).unwrap();
        cfg.register_task(ev, task(1)).unwrap();
        cfg.register_task(ev, task(3)).unwrap();
        cfg.set_process_stack(Pid(1), s1.desc()).unwrap();
        cfg.set_process_stack(Pid(3), s3.desc()).unwrap();
        cfg.grant_permission_suspend_process(Pid(1), Pid(3)).unwrap();
        assert_eq!(
            cfg.init_kernel().err(),
            Some(ConfigError::SuspendGrantBad)
        );
    }

    #[test]
    fn failing_init_task_stops_the_boot() {
        use crate::arch::SimStack;

        let stack = SimStack::new(512);
        let mut cfg = Config::new();
        let ev = cfg.create_event(sw_event(3)).unwrap();
        cfg.register_task(ev, task(2)).unwrap();
        cfg.set_process_stack(Pid(2), stack.desc()).unwrap();
        cfg.register_init_task(TaskDesc {
            entry: failing_init,
            budget: 0,
            pid: Pid(2),
        })
        .unwrap();
        assert_eq!(
            cfg.init_kernel().err(),
            Some(ConfigError::InitTaskFailed {
                pid: Pid(2),
                code: abi::AbortCause::UserAbort.error_code(),
            })
        );

        // The failed boot uninstalled itself; a corrected configuration
        // can start on the same thread.
        let stack = SimStack::new(512);
        let mut cfg = Config::new();
        let ev = cfg.create_event(sw_event(3)).unwrap();
        cfg.register_task(ev, task(2)).unwrap();
        cfg.set_process_stack(Pid(2), stack.desc()).unwrap();
        let handle = cfg.init_kernel().unwrap();
        assert_eq!(crate::sched::system_time_ms(), 0);
        assert!(!crate::proc::is_process_suspended(Pid(2)));
        drop(handle);
    }
}
